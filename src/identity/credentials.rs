// Credential bindings — DeviceId to public key, trust-on-first-use

use super::{DeviceId, KeyPair};
use crate::storage::StorageBackend;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const CREDENTIAL_PREFIX: &[u8] = b"credentials::";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// A different key is already bound to this device
    #[error("conflicting public key for an already-bound device")]
    IdentityConflict,
    #[error("attestation signature did not verify")]
    BadAttestation,
    #[error("authority attestation presented but no authority key is provisioned")]
    NoAuthority,
    #[error("malformed public key bytes")]
    MalformedKey,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Evidence that a DeviceId → PublicKey binding is genuine.
///
/// Self-signed attestations are accepted on a trust-on-first-use basis;
/// authority attestations are countersignatures by a pre-provisioned key.
/// Either way the signature covers the binding content (device id + key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attestation {
    SelfSigned(Vec<u8>),
    Authority(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    public_key: [u8; 32],
    attestation: Attestation,
}

/// Maps device identifiers to their long-lived public keys.
///
/// Once a binding has been accepted, `lookup` returns the same key for
/// the device's lifetime; conflicting re-bindings are rejected.
pub struct CredentialsStore {
    bindings: HashMap<DeviceId, VerifyingKey>,
    authority: Option<VerifyingKey>,
    storage: Option<Arc<dyn StorageBackend>>,
}

/// The byte string an attestation signature covers.
pub fn binding_content(device: &DeviceId, public_key: &[u8; 32]) -> Vec<u8> {
    let mut content = Vec::with_capacity(48);
    content.extend_from_slice(device.as_bytes());
    content.extend_from_slice(public_key);
    content
}

impl CredentialsStore {
    /// In-memory store without an authority key
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            authority: None,
            storage: None,
        }
    }

    /// In-memory store that accepts authority attestations
    pub fn with_authority(authority: VerifyingKey) -> Self {
        Self {
            bindings: HashMap::new(),
            authority: Some(authority),
            storage: None,
        }
    }

    /// Storage-backed store; previously-persisted bindings are reloaded.
    pub fn persistent(
        storage: Arc<dyn StorageBackend>,
        authority: Option<VerifyingKey>,
    ) -> Result<Self, CredentialError> {
        let mut store = Self {
            bindings: HashMap::new(),
            authority,
            storage: None,
        };

        let persisted = storage
            .scan_prefix(CREDENTIAL_PREFIX)
            .map_err(CredentialError::Storage)?;
        for (key, value) in persisted {
            let id_bytes = &key[CREDENTIAL_PREFIX.len()..];
            let Ok(id_bytes) = <[u8; 16]>::try_from(id_bytes) else {
                tracing::warn!("skipping credential record with malformed key");
                continue;
            };
            let Ok(record) = bincode::deserialize::<StoredCredential>(&value) else {
                tracing::warn!("skipping undecodable credential record");
                continue;
            };
            let device = DeviceId::from_bytes(id_bytes);
            if let Ok(vk) = VerifyingKey::from_bytes(&record.public_key) {
                store.bindings.insert(device, vk);
            }
        }

        store.storage = Some(storage);
        Ok(store)
    }

    /// Look up the public key bound to a device
    pub fn lookup(&self, device: &DeviceId) -> Option<&VerifyingKey> {
        self.bindings.get(device)
    }

    /// Insert a binding after checking its attestation.
    ///
    /// Re-inserting the identical binding is a no-op; a different key for
    /// an already-bound device is rejected and the old binding kept.
    pub fn insert(
        &mut self,
        device: DeviceId,
        public_key: [u8; 32],
        attestation: Attestation,
    ) -> Result<(), CredentialError> {
        let vk = VerifyingKey::from_bytes(&public_key).map_err(|_| CredentialError::MalformedKey)?;

        if let Some(existing) = self.bindings.get(&device) {
            if existing.to_bytes() == public_key {
                return Ok(());
            }
            tracing::warn!(device = %device, "rejected conflicting credential");
            return Err(CredentialError::IdentityConflict);
        }

        let content = binding_content(&device, &public_key);
        let attested = match &attestation {
            Attestation::SelfSigned(sig) => KeyPair::verify_with(&vk, &content, sig),
            Attestation::Authority(sig) => {
                let authority = self.authority.as_ref().ok_or(CredentialError::NoAuthority)?;
                KeyPair::verify_with(authority, &content, sig)
            }
        };
        if !attested {
            return Err(CredentialError::BadAttestation);
        }

        if let Some(storage) = &self.storage {
            let mut key = CREDENTIAL_PREFIX.to_vec();
            key.extend_from_slice(device.as_bytes());
            let record = StoredCredential {
                public_key,
                attestation,
            };
            let value = bincode::serialize(&record).unwrap_or_default();
            storage.put(&key, &value).map_err(CredentialError::Storage)?;
        }

        self.bindings.insert(device, vk);
        Ok(())
    }

    /// Convenience: bind a device to its own keypair, self-attested.
    pub fn insert_self_signed(
        &mut self,
        device: DeviceId,
        keys: &KeyPair,
    ) -> Result<(), CredentialError> {
        let public_key = keys.public_key_bytes();
        let sig = keys.sign(&binding_content(&device, &public_key));
        self.insert(device, public_key, Attestation::SelfSigned(sig))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for CredentialsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_self_signed_binding_accepted() {
        let mut store = CredentialsStore::new();
        let device = DeviceId::random();
        let keys = KeyPair::generate();

        store.insert_self_signed(device, &keys).unwrap();
        assert_eq!(
            store.lookup(&device).unwrap().to_bytes(),
            keys.public_key_bytes()
        );
    }

    #[test]
    fn test_conflicting_binding_rejected() {
        let mut store = CredentialsStore::new();
        let device = DeviceId::random();
        let keys = KeyPair::generate();
        let other = KeyPair::generate();

        store.insert_self_signed(device, &keys).unwrap();

        let result = store.insert_self_signed(device, &other);
        assert_eq!(result, Err(CredentialError::IdentityConflict));

        // Existing binding preserved
        assert_eq!(
            store.lookup(&device).unwrap().to_bytes(),
            keys.public_key_bytes()
        );
    }

    #[test]
    fn test_reinsert_same_binding_is_noop() {
        let mut store = CredentialsStore::new();
        let device = DeviceId::random();
        let keys = KeyPair::generate();

        store.insert_self_signed(device, &keys).unwrap();
        store.insert_self_signed(device, &keys).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bad_attestation_rejected() {
        let mut store = CredentialsStore::new();
        let device = DeviceId::random();
        let keys = KeyPair::generate();

        let result = store.insert(
            device,
            keys.public_key_bytes(),
            Attestation::SelfSigned(vec![0u8; 64]),
        );
        assert_eq!(result, Err(CredentialError::BadAttestation));
        assert!(store.lookup(&device).is_none());
    }

    #[test]
    fn test_authority_attestation() {
        let authority = KeyPair::generate();
        let mut store = CredentialsStore::with_authority(authority.verifying_key());

        let device = DeviceId::random();
        let keys = KeyPair::generate();
        let public_key = keys.public_key_bytes();
        let sig = authority.sign(&binding_content(&device, &public_key));

        store
            .insert(device, public_key, Attestation::Authority(sig))
            .unwrap();
        assert!(store.lookup(&device).is_some());
    }

    #[test]
    fn test_authority_attestation_without_authority_key() {
        let mut store = CredentialsStore::new();
        let device = DeviceId::random();
        let keys = KeyPair::generate();

        let result = store.insert(
            device,
            keys.public_key_bytes(),
            Attestation::Authority(vec![0u8; 64]),
        );
        assert_eq!(result, Err(CredentialError::NoAuthority));
    }

    #[test]
    fn test_persistent_reload() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let device = DeviceId::random();
        let keys = KeyPair::generate();

        {
            let mut store = CredentialsStore::persistent(storage.clone(), None).unwrap();
            store.insert_self_signed(device, &keys).unwrap();
        }

        let reloaded = CredentialsStore::persistent(storage, None).unwrap();
        assert_eq!(
            reloaded.lookup(&device).unwrap().to_bytes(),
            keys.public_key_bytes()
        );
    }
}
