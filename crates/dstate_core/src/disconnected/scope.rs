//! Scoped guards: attached sessions, connected reads, transaction scopes.

use super::DisconnectedState;
use crate::entity::EntityState;
use crate::error::CoreResult;
use crate::session::{BackingSession, Query};
use dstate_protocol::{CheckpointId, FieldId, FieldValue, Key, KeyMapping, TypeTag};
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// A disconnected state bound to a live session.
///
/// Offline operations stay available through `Deref`. Dropping the guard
/// detaches the session.
#[must_use = "the session is detached when the guard is dropped"]
pub struct Attached<'a, S: BackingSession> {
    state: &'a mut DisconnectedState,
    session: &'a mut S,
}

impl<'a, S: BackingSession> Attached<'a, S> {
    pub(crate) fn new(state: &'a mut DisconnectedState, session: &'a mut S) -> Self {
        Self { state, session }
    }

    /// Returns the attached session.
    pub fn session(&mut self) -> &mut S {
        self.session
    }

    /// Opens a connected scope in which cache misses are served by the
    /// session.
    pub fn connect(&mut self) -> Connected<'_> {
        Connected {
            state: &mut *self.state,
            session: &mut *self.session,
        }
    }

    /// Flushes every operation not held back by a pin.
    ///
    /// Deferred operations stay in the log for a later flush. Permanent
    /// keys replace temporary ones everywhere for the flushed entities.
    ///
    /// # Errors
    ///
    /// Fails with `VersionConflict` or `ReplayFailed`; the log and the cache
    /// are unchanged on error.
    pub fn apply_changes(&mut self) -> CoreResult<KeyMapping> {
        self.state.apply_changes_with(&mut *self.session)
    }

    /// Flushes the whole log and starts a new cycle.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` inside a transaction scope or while pins
    /// are outstanding, otherwise as [`Attached::apply_changes`].
    pub fn save_changes(&mut self) -> CoreResult<KeyMapping> {
        self.state.save_changes_with(&mut *self.session)
    }

    /// Opens a transaction scope over the attached state.
    pub fn transaction(&mut self) -> TransactionScope<'_, Self> {
        TransactionScope::open(self)
    }

    /// Detaches the session.
    pub fn detach(self) {}
}

impl<S: BackingSession> Deref for Attached<'_, S> {
    type Target = DisconnectedState;

    fn deref(&self) -> &DisconnectedState {
        self.state
    }
}

impl<S: BackingSession> DerefMut for Attached<'_, S> {
    fn deref_mut(&mut self) -> &mut DisconnectedState {
        self.state
    }
}

impl<S: BackingSession> AsMut<DisconnectedState> for Attached<'_, S> {
    fn as_mut(&mut self) -> &mut DisconnectedState {
        self.state
    }
}

impl<S: BackingSession> Drop for Attached<'_, S> {
    fn drop(&mut self) {
        self.state.attached = false;
        debug!("detached");
    }
}

/// Reads that may reach the store on a cache miss.
///
/// Fetched entities are merged into the cache under the configured
/// [`MergeMode`](crate::MergeMode); loaded values of modified entities are
/// never overwritten.
pub struct Connected<'a> {
    state: &'a mut DisconnectedState,
    session: &'a mut (dyn BackingSession + 'a),
}

impl<'a> Connected<'a> {
    /// Runs a query and merges the results. Returns the keys fetched.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn prefetch(&mut self, query: &Query) -> CoreResult<Vec<Key>> {
        self.state.prefetch_query(query, &mut *self.session)
    }

    /// Fetches the given keys.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn prefetch_keys(&mut self, keys: &[Key]) -> CoreResult<Vec<Key>> {
        self.prefetch(&Query::Keys(keys.to_vec()))
    }

    /// Merges entities produced by a caller-supplied fetch.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error.
    pub fn prefetch_with<F>(&mut self, fetch: F) -> CoreResult<Vec<Key>>
    where
        F: FnOnce(&mut (dyn BackingSession + 'a)) -> CoreResult<Vec<EntityState>>,
    {
        let fetched = fetch(&mut *self.session)?;
        Ok(self.state.merge_all(fetched))
    }

    /// Returns a live entity, fetching it on a cache miss.
    ///
    /// # Errors
    ///
    /// Fails with `EntityNotFound` if the store does not hold it and
    /// `InvalidState` if it was removed locally.
    pub fn get(&mut self, key: &Key) -> CoreResult<&EntityState> {
        self.state.fetch_entity(key, &mut *self.session)
    }

    /// Returns a field, loading the entity or the lazy field as needed.
    ///
    /// # Errors
    ///
    /// As [`Connected::get`], plus schema errors for unknown fields.
    pub fn field(&mut self, key: &Key, field: FieldId) -> CoreResult<FieldValue> {
        self.state.load_field(key, field, &mut *self.session)
    }

    /// Re-reads entities from the store.
    ///
    /// Unmodified entities are replaced by the store's state. Entities
    /// with pending changes are rebased: fields no pending operation
    /// writes take the store's values, and the captured and logged base
    /// versions move to the store's version, so a save rejected with a
    /// version conflict can be retried. Returns the keys re-read.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` inside a transaction scope or for an
    /// entity created in this cycle, with `EntityNotFound` if the store no
    /// longer holds the entity, and with store errors.
    pub fn refresh(&mut self, keys: &[Key]) -> CoreResult<Vec<Key>> {
        self.state.refresh_with(keys, &mut *self.session)
    }

    /// Creates an entity, fetching uncached version roots it names.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::create_with`], except that missing version
    /// roots are fetched, plus store errors.
    pub fn create_with(
        &mut self,
        type_tag: TypeTag,
        values: Vec<(FieldId, FieldValue)>,
    ) -> CoreResult<Key> {
        self.state.create_in(type_tag, values, Some(&mut *self.session))
    }

    /// Sets one field, fetching uncached version roots of the entity.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::set_field`], except that missing version
    /// roots are fetched, plus store errors.
    pub fn set_field(
        &mut self,
        key: &Key,
        field: FieldId,
        value: impl Into<FieldValue>,
    ) -> CoreResult<()> {
        self.set_fields(key, vec![(field, value.into())])
    }

    /// Sets several fields, fetching uncached version roots of the entity.
    ///
    /// # Errors
    ///
    /// As [`Connected::set_field`].
    pub fn set_fields(&mut self, key: &Key, values: Vec<(FieldId, FieldValue)>) -> CoreResult<()> {
        self.state.set_fields_in(key, values, Some(&mut *self.session))
    }

    /// Adds an item to a collection, fetching uncached version roots.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::add_to_collection`], plus store errors.
    pub fn add_to_collection(&mut self, key: &Key, field: FieldId, item: &Key) -> CoreResult<()> {
        self.state
            .add_to_collection_in(key, field, item, Some(&mut *self.session))
    }

    /// Removes an item from a collection, fetching uncached version roots.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::remove_from_collection`], plus store errors.
    pub fn remove_from_collection(
        &mut self,
        key: &Key,
        field: FieldId,
        item: &Key,
    ) -> CoreResult<()> {
        self.state
            .remove_from_collection_in(key, field, item, Some(&mut *self.session))
    }

    /// Empties a collection, fetching uncached version roots.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::clear_collection`], plus store errors.
    pub fn clear_collection(&mut self, key: &Key, field: FieldId) -> CoreResult<()> {
        self.state
            .clear_collection_in(key, field, Some(&mut *self.session))
    }

    /// Removes an entity, also consulting the store for referencing
    /// entities and version roots that are not cached.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::remove`], plus store errors.
    pub fn remove(&mut self, key: &Key) -> CoreResult<()> {
        self.state.remove_with(key, Some(&mut *self.session))
    }
}

impl Deref for Connected<'_> {
    type Target = DisconnectedState;

    fn deref(&self) -> &DisconnectedState {
        self.state
    }
}

impl DerefMut for Connected<'_> {
    fn deref_mut(&mut self) -> &mut DisconnectedState {
        self.state
    }
}

/// A nested unit of offline work.
///
/// Operations performed through the scope are kept only if
/// [`TransactionScope::complete`] is called before the scope is dropped;
/// otherwise the log is truncated to the scope's checkpoint and the cache
/// is restored. Scopes nest and must be closed innermost first, which
/// the borrow on the parent guarantees.
#[must_use = "the scope rolls back when dropped without complete()"]
pub struct TransactionScope<'a, T: AsMut<DisconnectedState>> {
    inner: &'a mut T,
    checkpoint: CheckpointId,
    completed: bool,
}

impl<'a, T: AsMut<DisconnectedState>> TransactionScope<'a, T> {
    pub(crate) fn open(inner: &'a mut T) -> Self {
        let checkpoint = inner.as_mut().open_scope();
        Self {
            inner,
            checkpoint,
            completed: false,
        }
    }

    /// Returns the log checkpoint this scope rolls back to.
    pub fn checkpoint(&self) -> CheckpointId {
        self.checkpoint
    }

    /// Returns true once [`TransactionScope::complete`] succeeded.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Marks the scope's work as kept.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` while pins are outstanding.
    pub fn complete(&mut self) -> CoreResult<()> {
        self.inner.as_mut().ensure_unpinned()?;
        self.completed = true;
        Ok(())
    }

    /// Opens a nested scope.
    pub fn transaction(&mut self) -> TransactionScope<'_, Self> {
        TransactionScope::open(self)
    }
}

impl<T: AsMut<DisconnectedState>> Deref for TransactionScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T: AsMut<DisconnectedState>> DerefMut for TransactionScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
    }
}

impl<T: AsMut<DisconnectedState>> AsMut<DisconnectedState> for TransactionScope<'_, T> {
    fn as_mut(&mut self) -> &mut DisconnectedState {
        self.inner.as_mut()
    }
}

impl<T: AsMut<DisconnectedState>> Drop for TransactionScope<'_, T> {
    fn drop(&mut self) {
        let completed = self.completed;
        if let Err(e) = self.inner.as_mut().close_scope(self.checkpoint, completed) {
            warn!(error = %e, "failed to close transaction scope");
        }
    }
}
