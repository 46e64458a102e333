//! Backing session contract and the in-memory reference store.

mod memory;

pub use memory::{MemorySession, MemoryStore};

use crate::entity::EntityState;
use crate::error::CoreResult;
use dstate_protocol::{FieldId, Key, Operation, TypeTag, VersionInfo};

/// Declarative fetch request understood by a backing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every entity of a type.
    All(TypeTag),
    /// The listed entities that exist.
    Keys(Vec<Key>),
    /// Entities of `type_tag` whose `field` points at `target`.
    Referencing {
        /// Type of the referencing entities.
        type_tag: TypeTag,
        /// Reference or collection field.
        field: FieldId,
        /// Referenced entity.
        target: Key,
    },
}

/// Live, store-backed session a disconnected state attaches to.
///
/// States returned by the fetch methods are [`Synchronized`] and carry the
/// store's current version as their captured version. Query fetches may
/// leave lazy fields unavailable; key fetches load every field.
///
/// [`Synchronized`]: crate::PersistenceState::Synchronized
pub trait BackingSession {
    /// Fetches one entity.
    fn fetch_by_key(&mut self, key: &Key) -> CoreResult<Option<EntityState>>;

    /// Fetches every entity matching `query`.
    fn fetch_by_query(&mut self, query: &Query) -> CoreResult<Vec<EntityState>>;

    /// Opens the store transaction used for replay.
    fn begin_transaction(&mut self) -> CoreResult<()>;

    /// Commits the open transaction.
    fn commit(&mut self) -> CoreResult<()>;

    /// Rolls the open transaction back.
    fn rollback(&mut self) -> CoreResult<()>;

    /// Allocates a permanent key for a new entity of `type_tag`.
    fn allocate_permanent_key(&mut self, type_tag: TypeTag) -> CoreResult<Key>;

    /// Returns the store's current version of `key`, `None` if absent.
    fn current_version_of(&mut self, key: &Key) -> CoreResult<Option<VersionInfo>>;

    /// Applies one operation inside the open transaction.
    fn execute_operation(&mut self, operation: &Operation) -> CoreResult<()>;
}

impl<S: BackingSession + ?Sized> BackingSession for &mut S {
    fn fetch_by_key(&mut self, key: &Key) -> CoreResult<Option<EntityState>> {
        (**self).fetch_by_key(key)
    }

    fn fetch_by_query(&mut self, query: &Query) -> CoreResult<Vec<EntityState>> {
        (**self).fetch_by_query(query)
    }

    fn begin_transaction(&mut self) -> CoreResult<()> {
        (**self).begin_transaction()
    }

    fn commit(&mut self) -> CoreResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> CoreResult<()> {
        (**self).rollback()
    }

    fn allocate_permanent_key(&mut self, type_tag: TypeTag) -> CoreResult<Key> {
        (**self).allocate_permanent_key(type_tag)
    }

    fn current_version_of(&mut self, key: &Key) -> CoreResult<Option<VersionInfo>> {
        (**self).current_version_of(key)
    }

    fn execute_operation(&mut self, operation: &Operation) -> CoreResult<()> {
        (**self).execute_operation(operation)
    }
}
