//! Mutation records.

use crate::key::{Key, TypeTag};
use crate::mapping::KeyMapping;
use crate::value::{FieldId, FieldValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag of an [`Operation`] variant, used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Entity creation.
    CreateEntity,
    /// Entity removal.
    RemoveEntity,
    /// Scalar or reference field assignment.
    SetField,
    /// Item added to a collection field.
    CollectionAdd,
    /// Item removed from a collection field.
    CollectionRemove,
    /// Collection field emptied.
    CollectionClear,
}

impl OperationKind {
    /// Converts to the numeric wire tag.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationKind::CreateEntity => 1,
            OperationKind::RemoveEntity => 2,
            OperationKind::SetField => 3,
            OperationKind::CollectionAdd => 4,
            OperationKind::CollectionRemove => 5,
            OperationKind::CollectionClear => 6,
        }
    }

    /// Converts from a numeric wire tag.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationKind::CreateEntity),
            2 => Some(OperationKind::RemoveEntity),
            3 => Some(OperationKind::SetField),
            4 => Some(OperationKind::CollectionAdd),
            5 => Some(OperationKind::CollectionRemove),
            6 => Some(OperationKind::CollectionClear),
            _ => None,
        }
    }

    /// Returns a short uppercase label for dumps.
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::CreateEntity => "CREATE",
            OperationKind::RemoveEntity => "REMOVE",
            OperationKind::SetField => "SET",
            OperationKind::CollectionAdd => "ADD",
            OperationKind::CollectionRemove => "UNLINK",
            OperationKind::CollectionClear => "CLEAR",
        }
    }
}

/// One atomic mutation in the replay log.
///
/// Operations are immutable once appended to a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Creates a new entity of the given type.
    CreateEntity {
        /// Key of the new entity (usually temporary).
        key: Key,
        /// Type of the new entity.
        type_tag: TypeTag,
    },
    /// Removes an entity.
    RemoveEntity {
        /// Entity being removed.
        key: Key,
    },
    /// Assigns a field.
    SetField {
        /// Entity being modified.
        key: Key,
        /// Field being assigned.
        field: FieldId,
        /// New value.
        value: FieldValue,
    },
    /// Adds an item to a collection field.
    CollectionAdd {
        /// Collection owner.
        key: Key,
        /// Collection field.
        field: FieldId,
        /// Item added.
        item: Key,
    },
    /// Removes an item from a collection field.
    CollectionRemove {
        /// Collection owner.
        key: Key,
        /// Collection field.
        field: FieldId,
        /// Item removed.
        item: Key,
    },
    /// Removes every item from a collection field.
    CollectionClear {
        /// Collection owner.
        key: Key,
        /// Collection field.
        field: FieldId,
    },
}

impl Operation {
    /// Returns the variant tag.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateEntity { .. } => OperationKind::CreateEntity,
            Operation::RemoveEntity { .. } => OperationKind::RemoveEntity,
            Operation::SetField { .. } => OperationKind::SetField,
            Operation::CollectionAdd { .. } => OperationKind::CollectionAdd,
            Operation::CollectionRemove { .. } => OperationKind::CollectionRemove,
            Operation::CollectionClear { .. } => OperationKind::CollectionClear,
        }
    }

    /// Returns the key of the entity this operation mutates.
    pub fn key(&self) -> &Key {
        match self {
            Operation::CreateEntity { key, .. }
            | Operation::RemoveEntity { key }
            | Operation::SetField { key, .. }
            | Operation::CollectionAdd { key, .. }
            | Operation::CollectionRemove { key, .. }
            | Operation::CollectionClear { key, .. } => key,
        }
    }

    /// Returns the field this operation touches, if any.
    pub fn field(&self) -> Option<FieldId> {
        match self {
            Operation::SetField { field, .. }
            | Operation::CollectionAdd { field, .. }
            | Operation::CollectionRemove { field, .. }
            | Operation::CollectionClear { field, .. } => Some(*field),
            Operation::CreateEntity { .. } | Operation::RemoveEntity { .. } => None,
        }
    }

    /// Returns the keys this operation points at, other than its subject.
    pub fn referenced_keys(&self) -> Vec<&Key> {
        match self {
            Operation::SetField { value, .. } => value.referenced_keys(),
            Operation::CollectionAdd { item, .. } | Operation::CollectionRemove { item, .. } => {
                vec![item]
            }
            _ => Vec::new(),
        }
    }

    /// Returns the subject key followed by every referenced key.
    pub fn touched_keys(&self) -> Vec<&Key> {
        let mut keys = vec![self.key()];
        keys.extend(self.referenced_keys());
        keys
    }

    /// Returns a copy with every key rewritten through `mapping`.
    #[must_use]
    pub fn remapped(&self, mapping: &KeyMapping) -> Operation {
        let mut op = self.clone();
        op.map_keys(&mut |key| mapping.get(key).cloned());
        op
    }

    /// Rewrites every embedded key through `f`, leaving unmatched keys alone.
    pub fn map_keys(&mut self, f: &mut impl FnMut(&Key) -> Option<Key>) {
        let mut swap = |key: &mut Key| {
            if let Some(new_key) = f(key) {
                *key = new_key;
            }
        };
        match self {
            Operation::CreateEntity { key, .. }
            | Operation::RemoveEntity { key }
            | Operation::CollectionClear { key, .. } => swap(key),
            Operation::SetField { key, value, .. } => {
                swap(key);
                value.map_keys(&mut |k| {
                    let mut k = k.clone();
                    swap(&mut k);
                    Some(k)
                });
            }
            Operation::CollectionAdd { key, item, .. }
            | Operation::CollectionRemove { key, item, .. } => {
                swap(key);
                swap(item);
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.kind().label();
        match self {
            Operation::CreateEntity { key, type_tag } => write!(f, "{label} {key} ({type_tag})"),
            Operation::RemoveEntity { key } => write!(f, "{label} {key}"),
            Operation::SetField { key, field, value } => {
                write!(f, "{label} {key}.{field} = {value}")
            }
            Operation::CollectionAdd { key, field, item }
            | Operation::CollectionRemove { key, field, item } => {
                write!(f, "{label} {key}.{field} {item}")
            }
            Operation::CollectionClear { key, field } => write!(f, "{label} {key}.{field}"),
        }
    }
}
