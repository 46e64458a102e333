//! Entity keys.

use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an entity type in the schema table.
///
/// Type tags are stable and assigned when the schema is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Creates a new type tag.
    #[must_use]
    pub const fn new(tag: u32) -> Self {
        Self(tag)
    }

    /// Returns the raw tag value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Typed identifier of an entity.
///
/// A key is a type tag plus a value tuple, flagged temporary or permanent.
/// Temporary keys are minted locally when an entity is created offline and
/// are only meaningful within one disconnected cycle; the store replaces
/// them with permanent keys on replay.
///
/// A temporary key and a permanent key with the same tag and tuple are
/// different identities.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    type_tag: TypeTag,
    values: Vec<FieldValue>,
    temporary: bool,
}

impl Key {
    /// Creates a permanent key.
    #[must_use]
    pub fn permanent(type_tag: TypeTag, values: Vec<FieldValue>) -> Self {
        Self {
            type_tag,
            values,
            temporary: false,
        }
    }

    /// Creates a temporary key.
    #[must_use]
    pub fn temporary(type_tag: TypeTag, values: Vec<FieldValue>) -> Self {
        Self {
            type_tag,
            values,
            temporary: true,
        }
    }

    /// Creates a permanent key with a single integer value.
    #[must_use]
    pub fn from_id(type_tag: TypeTag, id: i64) -> Self {
        Self::permanent(type_tag, vec![FieldValue::Integer(id)])
    }

    /// Returns the type tag.
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Returns the value tuple.
    #[must_use]
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Returns true if this key was minted locally and not yet replaced.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.type_tag)?;
        if self.temporary {
            f.write_str("~")?;
        }
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

/// Mints temporary keys for entities created while disconnected.
///
/// Each allocator hands out a strictly increasing integer per call,
/// independent of the type tag.
#[derive(Debug, Default, Clone)]
pub struct TemporaryKeyAllocator {
    last: i64,
}

impl TemporaryKeyAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next temporary key for `type_tag`.
    pub fn allocate(&mut self, type_tag: TypeTag) -> Key {
        self.last += 1;
        Key::temporary(type_tag, vec![FieldValue::Integer(self.last)])
    }

    /// Makes sure future keys do not collide with `key`.
    pub fn observe(&mut self, key: &Key) {
        if !key.is_temporary() {
            return;
        }
        if let [FieldValue::Integer(n)] = key.values() {
            self.last = self.last.max(*n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_and_permanent_are_distinct() {
        let tag = TypeTag::new(3);
        let temp = Key::temporary(tag, vec![FieldValue::Integer(1)]);
        let perm = Key::permanent(tag, vec![FieldValue::Integer(1)]);
        assert_ne!(temp, perm);
        assert!(temp.is_temporary());
        assert!(!perm.is_temporary());
    }

    #[test]
    fn equal_when_tag_and_tuple_match() {
        let a = Key::from_id(TypeTag::new(1), 7);
        let b = Key::permanent(TypeTag::new(1), vec![FieldValue::Integer(7)]);
        assert_eq!(a, b);
        assert_ne!(a, Key::from_id(TypeTag::new(2), 7));
    }

    #[test]
    fn display() {
        assert_eq!(Key::from_id(TypeTag::new(2), 7).to_string(), "t2:7");
        let temp = Key::temporary(TypeTag::new(2), vec![FieldValue::Integer(1)]);
        assert_eq!(temp.to_string(), "t2:~1");
    }

    #[test]
    fn allocator_is_monotonic() {
        let mut alloc = TemporaryKeyAllocator::new();
        let a = alloc.allocate(TypeTag::new(1));
        let b = alloc.allocate(TypeTag::new(2));
        assert!(a.is_temporary());
        assert_eq!(a.values(), &[FieldValue::Integer(1)]);
        assert_eq!(b.values(), &[FieldValue::Integer(2)]);
    }

    #[test]
    fn allocator_skips_observed_keys() {
        let mut alloc = TemporaryKeyAllocator::new();
        alloc.observe(&Key::temporary(TypeTag::new(1), vec![FieldValue::Integer(9)]));
        alloc.observe(&Key::from_id(TypeTag::new(1), 100));
        let next = alloc.allocate(TypeTag::new(1));
        assert_eq!(next.values(), &[FieldValue::Integer(10)]);
    }
}
