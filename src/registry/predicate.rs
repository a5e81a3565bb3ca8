// Permission predicates — who may affect head state

use super::entry::RegistryEntry;

/// Decides whether an entry's state effect is applied during head
/// materialization. Evaluated as a pure function of the full entry
/// list and the entry's canonical index; it can never mutate registry
/// state. Rejected entries stay in the log so replicas with different
/// trust roots still converge on the same entry set.
#[derive(Debug, Clone)]
pub enum RegistryPredicate {
    /// Every entry's effect is applied
    AlwaysAllow,
    /// Only the holder of the key that first wrote a registry key may
    /// modify it afterwards
    CreatorOwnsKey,
    /// Only entries signed by the given authority key take effect
    AuthoritySigned { authority: Vec<u8> },
}

impl RegistryPredicate {
    pub fn permits<V>(&self, entries: &[RegistryEntry<V>], index: usize) -> bool {
        match self {
            RegistryPredicate::AlwaysAllow => true,
            RegistryPredicate::CreatorOwnsKey => {
                let entry = &entries[index];
                entries
                    .iter()
                    .find(|e| e.key == entry.key)
                    .map(|creator| creator.public_key == entry.public_key)
                    .unwrap_or(true)
            }
            RegistryPredicate::AuthoritySigned { authority } => {
                entries[index].public_key == *authority
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use crate::registry::entry::EntryKind;
    use uuid::Uuid;

    fn make_entry(key: &str, keys: &KeyPair) -> RegistryEntry<Vec<u8>> {
        RegistryEntry::create(Uuid::nil(), EntryKind::Upsert, key, Some(vec![1]), keys, 0)
    }

    #[test]
    fn test_always_allow() {
        let keys = KeyPair::generate();
        let entries = vec![make_entry("a", &keys)];
        assert!(RegistryPredicate::AlwaysAllow.permits(&entries, 0));
    }

    #[test]
    fn test_creator_owns_key() {
        let creator = KeyPair::generate();
        let intruder = KeyPair::generate();
        let entries = vec![
            make_entry("a", &creator),
            make_entry("a", &intruder),
            make_entry("a", &creator),
            make_entry("b", &intruder),
        ];

        let predicate = RegistryPredicate::CreatorOwnsKey;
        assert!(predicate.permits(&entries, 0));
        assert!(!predicate.permits(&entries, 1));
        assert!(predicate.permits(&entries, 2));
        // A different key has its own creator
        assert!(predicate.permits(&entries, 3));
    }

    #[test]
    fn test_authority_signed() {
        let authority = KeyPair::generate();
        let other = KeyPair::generate();
        let entries = vec![make_entry("a", &authority), make_entry("b", &other)];

        let predicate = RegistryPredicate::AuthoritySigned {
            authority: authority.public_key_bytes().to_vec(),
        };
        assert!(predicate.permits(&entries, 0));
        assert!(!predicate.permits(&entries, 1));
    }
}
