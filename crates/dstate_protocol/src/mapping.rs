//! Temporary-to-permanent key mapping.

use crate::error::{ProtocolError, ProtocolResult};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bijection from temporary keys to the permanent keys that replaced them.
///
/// A successful replay produces exactly one mapping. Remapping is
/// idempotent: permanent keys are never in the mapping's domain, so
/// `try_remap(try_remap(k)) == try_remap(k)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    forward: BTreeMap<Key, Key>,
}

impl KeyMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `temporary` was replaced by `permanent`.
    ///
    /// # Errors
    ///
    /// Fails if `temporary` is not a temporary key, `permanent` is not a
    /// permanent key, or either side is already mapped to something else.
    pub fn insert(&mut self, temporary: Key, permanent: Key) -> ProtocolResult<()> {
        if !temporary.is_temporary() {
            return Err(ProtocolError::invalid_mapping(format!(
                "source {temporary} is not a temporary key"
            )));
        }
        if permanent.is_temporary() {
            return Err(ProtocolError::invalid_mapping(format!(
                "target {permanent} is not a permanent key"
            )));
        }
        if let Some(existing) = self.forward.get(&temporary) {
            if existing == &permanent {
                return Ok(());
            }
            return Err(ProtocolError::invalid_mapping(format!(
                "{temporary} is already mapped to {existing}"
            )));
        }
        if self.forward.values().any(|p| p == &permanent) {
            return Err(ProtocolError::invalid_mapping(format!(
                "{permanent} is already the target of another key"
            )));
        }
        self.forward.insert(temporary, permanent);
        Ok(())
    }

    /// Returns the permanent key for `key`, if it was remapped.
    pub fn get(&self, key: &Key) -> Option<&Key> {
        self.forward.get(key)
    }

    /// Returns the permanent key if `key` was remapped, otherwise `key` itself.
    pub fn try_remap(&self, key: &Key) -> Key {
        self.forward.get(key).unwrap_or(key).clone()
    }

    /// Returns true if `key` was remapped.
    pub fn contains(&self, key: &Key) -> bool {
        self.forward.contains_key(key)
    }

    /// Iterates (temporary, permanent) pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Key)> {
        self.forward.iter()
    }

    /// Returns the number of remapped keys.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns true if nothing was remapped.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Folds `other` into this mapping.
    ///
    /// # Errors
    ///
    /// Fails if an entry of `other` contradicts an existing entry.
    pub fn merge(&mut self, other: &KeyMapping) -> ProtocolResult<()> {
        for (temporary, permanent) in other.iter() {
            self.insert(temporary.clone(), permanent.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TypeTag;
    use crate::value::FieldValue;
    use proptest::prelude::*;

    fn temp(n: i64) -> Key {
        Key::temporary(TypeTag::new(1), vec![FieldValue::Integer(n)])
    }

    fn perm(n: i64) -> Key {
        Key::from_id(TypeTag::new(1), n)
    }

    #[test]
    fn remaps_known_keys_only() {
        let mut mapping = KeyMapping::new();
        mapping.insert(temp(1), perm(7)).unwrap();

        assert_eq!(mapping.try_remap(&temp(1)), perm(7));
        assert_eq!(mapping.try_remap(&temp(2)), temp(2));
        assert_eq!(mapping.try_remap(&perm(7)), perm(7));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn rejects_non_bijective_entries() {
        let mut mapping = KeyMapping::new();
        mapping.insert(temp(1), perm(7)).unwrap();

        assert!(mapping.insert(temp(1), perm(8)).is_err());
        assert!(mapping.insert(temp(2), perm(7)).is_err());
        assert!(mapping.insert(perm(3), perm(4)).is_err());
        assert!(mapping.insert(temp(3), temp(4)).is_err());
        // Re-inserting the same pair is harmless.
        assert!(mapping.insert(temp(1), perm(7)).is_ok());
    }

    #[test]
    fn merge_accumulates() {
        let mut history = KeyMapping::new();
        let mut first = KeyMapping::new();
        first.insert(temp(1), perm(10)).unwrap();
        let mut second = KeyMapping::new();
        second.insert(temp(2), perm(11)).unwrap();

        history.merge(&first).unwrap();
        history.merge(&second).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.try_remap(&temp(2)), perm(11));
    }

    proptest! {
        #[test]
        fn try_remap_is_idempotent(
            pairs in prop::collection::btree_map(0i64..50, 100i64..150, 0..20),
            lookup in 0i64..200,
            lookup_temporary in any::<bool>(),
        ) {
            let mut mapping = KeyMapping::new();
            let mut used = std::collections::BTreeSet::new();
            for (t, p) in pairs {
                if used.insert(p) {
                    mapping.insert(temp(t), perm(p)).unwrap();
                }
            }
            let key = if lookup_temporary { temp(lookup) } else { perm(lookup) };
            let once = mapping.try_remap(&key);
            prop_assert_eq!(mapping.try_remap(&once), once);
        }
    }
}
