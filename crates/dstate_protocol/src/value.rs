//! Field identifiers and field values.

use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a field in its type's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u16);

impl FieldId {
    /// Creates a new field ID.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the slot index in a field tuple.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A value held by one entity field.
///
/// Floats are intentionally absent so that values stay hashable and
/// totally ordered; keys embed values in their tuples.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum FieldValue {
    /// No value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Reference to another entity.
    Ref(Key),
    /// Contents of a collection field, in insertion order, without duplicates.
    Keys(Vec<Key>),
}

impl FieldValue {
    /// Returns true for [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the referenced key, if this is a reference.
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            FieldValue::Ref(key) => Some(key),
            _ => None,
        }
    }

    /// Returns the collection contents, if this is a collection.
    pub fn as_keys(&self) -> Option<&[Key]> {
        match self {
            FieldValue::Keys(keys) => Some(keys),
            _ => None,
        }
    }

    /// Returns every key this value points at.
    pub fn referenced_keys(&self) -> Vec<&Key> {
        match self {
            FieldValue::Ref(key) => vec![key],
            FieldValue::Keys(keys) => keys.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Returns true if this value points at `key`.
    pub fn references(&self, key: &Key) -> bool {
        match self {
            FieldValue::Ref(k) => k == key,
            FieldValue::Keys(keys) => keys.contains(key),
            _ => false,
        }
    }

    /// Rewrites every embedded key through `f`, leaving unmatched keys alone.
    pub fn map_keys(&mut self, f: &mut impl FnMut(&Key) -> Option<Key>) {
        match self {
            FieldValue::Ref(key) => {
                if let Some(new_key) = f(key) {
                    *key = new_key;
                }
            }
            FieldValue::Keys(keys) => {
                for key in keys.iter_mut() {
                    if let Some(new_key) = f(key) {
                        *key = new_key;
                    }
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::Text(s) => write!(f, "{s:?}"),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            FieldValue::Ref(key) => write!(f, "->{key}"),
            FieldValue::Keys(keys) => {
                f.write_str("[")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Integer(i64::from(n))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

impl From<Key> for FieldValue {
    fn from(key: Key) -> Self {
        FieldValue::Ref(key)
    }
}

impl From<Option<Key>> for FieldValue {
    fn from(key: Option<Key>) -> Self {
        key.map_or(FieldValue::Null, FieldValue::Ref)
    }
}
