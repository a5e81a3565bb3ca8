// Registry entries — signed, immutable, parent-linked

use crate::identity::KeyPair;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an entry does to its key when replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Upsert,
    Delete,
}

/// One signed record of the append-only log.
///
/// `parent_uuid` is the uuid of the entry this one supersedes, or nil
/// for a root entry. The parent link defines the entry tree whose
/// pre-order traversal (siblings ascending by uuid) is the canonical
/// total order. Entries are never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry<V> {
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub kind: EntryKind,
    pub key: String,
    /// Present for upserts, absent for deletes
    pub value: Option<V>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: u64,
}

impl<V: Serialize> RegistryEntry<V> {
    /// Create and sign a fresh entry.
    pub fn create(
        parent_uuid: Uuid,
        kind: EntryKind,
        key: &str,
        value: Option<V>,
        keys: &KeyPair,
        timestamp: u64,
    ) -> Self {
        let mut entry = Self {
            uuid: Uuid::new_v4(),
            parent_uuid,
            kind,
            key: key.to_string(),
            value,
            public_key: keys.public_key_bytes().to_vec(),
            signature: Vec::new(),
            timestamp,
        };
        entry.signature = keys.sign(&entry.signed_bytes());
        entry
    }

    /// The bytes the entry's signature covers. Also the per-entry input
    /// of the hash chain, so it must be deterministic.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.extend_from_slice(self.parent_uuid.as_bytes());
        buf.push(match self.kind {
            EntryKind::Upsert => 0,
            EntryKind::Delete => 1,
        });
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        match &self.value {
            Some(value) => {
                buf.push(1);
                buf.extend_from_slice(&bincode::serialize(value).unwrap_or_default());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Check the signature against the entry's own declared key.
    pub fn verify_signature(&self) -> bool {
        KeyPair::verify(&self.signed_bytes(), &self.signature, &self.public_key).unwrap_or(false)
    }

    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_entry_verifies() {
        let keys = KeyPair::generate();
        let entry = RegistryEntry::create(
            Uuid::nil(),
            EntryKind::Upsert,
            "key",
            Some(vec![1u8, 2, 3]),
            &keys,
            1_000,
        );

        assert!(entry.verify_signature());
        assert!(entry.is_root());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let keys = KeyPair::generate();
        let mut entry = RegistryEntry::create(
            Uuid::nil(),
            EntryKind::Upsert,
            "key",
            Some(vec![1u8]),
            &keys,
            1_000,
        );

        entry.value = Some(vec![9u8]);
        assert!(!entry.verify_signature());
    }

    #[test]
    fn test_signed_bytes_distinguish_kind() {
        let keys = KeyPair::generate();
        let upsert: RegistryEntry<Vec<u8>> =
            RegistryEntry::create(Uuid::nil(), EntryKind::Upsert, "k", None, &keys, 0);
        let mut delete = upsert.clone();
        delete.kind = EntryKind::Delete;

        assert_ne!(upsert.signed_bytes(), delete.signed_bytes());
        assert!(!delete.verify_signature());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let mut entry = RegistryEntry::create(
            Uuid::nil(),
            EntryKind::Upsert,
            "k",
            Some(vec![1u8]),
            &keys,
            0,
        );

        // Claiming a different key invalidates the signature
        entry.public_key = other.public_key_bytes().to_vec();
        assert!(!entry.verify_signature());
    }
}
