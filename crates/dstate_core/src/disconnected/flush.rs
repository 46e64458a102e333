//! Flushing the log to a session and merging fetched entities.

use super::DisconnectedState;
use crate::config::MergeMode;
use crate::entity::{EntityState, PersistenceState};
use crate::error::{CoreError, CoreResult};
use crate::session::{BackingSession, Query};
use crate::version::{Conflict, VersionTracker};
use dstate_protocol::{FieldId, FieldValue, Key, KeyMapping, Operation, OperationLog, VersionInfo};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl DisconnectedState {
    /// Replays every pending operation and starts a new cycle.
    pub(crate) fn save_changes_with<S: BackingSession + ?Sized>(
        &mut self,
        session: &mut S,
    ) -> CoreResult<KeyMapping> {
        if !self.scopes.is_empty() {
            return Err(CoreError::invalid_state(
                "cannot save while a transaction scope is open",
            ));
        }
        self.ensure_unpinned()?;
        let mapping = self.flush(session, false)?;
        if self.log.is_empty() {
            self.log = OperationLog::new();
        }
        info!(
            remapped = mapping.len(),
            cycle = %self.log.cycle_id(),
            "changes saved"
        );
        Ok(mapping)
    }

    /// Replays pending operations except those held back by pins.
    pub(crate) fn apply_changes_with<S: BackingSession + ?Sized>(
        &mut self,
        session: &mut S,
    ) -> CoreResult<KeyMapping> {
        let mapping = self.flush(session, true)?;
        info!(
            remapped = mapping.len(),
            deferred = self.log.len(),
            "changes applied"
        );
        Ok(mapping)
    }

    fn flush<S: BackingSession + ?Sized>(
        &mut self,
        session: &mut S,
        honor_pins: bool,
    ) -> CoreResult<KeyMapping> {
        let held = if honor_pins {
            self.held_keys()
        } else {
            BTreeSet::new()
        };

        let mut positions = BTreeSet::new();
        let mut batch = Vec::new();
        for (position, op) in self.log.operations().iter().enumerate() {
            if !held.contains(op.key()) {
                positions.insert(position);
                batch.push(op.clone());
            }
        }
        if batch.is_empty() {
            debug!(held = held.len(), "nothing to flush");
            return Ok(KeyMapping::new());
        }

        let mapping = self
            .engine
            .replay_operations(&batch, self.log.base_versions(), session)?;
        self.absorb_flush(&batch, &positions, &mapping)?;
        Ok(mapping)
    }

    /// Keys whose operations stay in the log: the pinned exclusion set, plus
    /// every entity with an operation naming a held key. An entity is
    /// either flushed whole or held whole.
    fn held_keys(&self) -> BTreeSet<Key> {
        let pending: BTreeSet<Key> = self.log.created_keys().into_iter().cloned().collect();
        let mut held = self
            .pins
            .lock()
            .excluded_keys(&self.cache, &pending, self.config.pin_cascade);
        if held.is_empty() {
            return held;
        }
        loop {
            let newly: Vec<Key> = self
                .log
                .operations()
                .iter()
                .filter(|op| !held.contains(op.key()))
                .filter(|op| op.touched_keys().into_iter().any(|k| held.contains(k)))
                .map(|op| op.key().clone())
                .collect();
            if newly.is_empty() {
                return held;
            }
            held.extend(newly);
        }
    }

    /// Brings cache, log, and tracker in line with a committed batch.
    fn absorb_flush(
        &mut self,
        batch: &[Operation],
        positions: &BTreeSet<usize>,
        mapping: &KeyMapping,
    ) -> CoreResult<()> {
        let subjects: BTreeSet<Key> = batch.iter().map(|op| op.key().clone()).collect();
        self.log.remove_positions(positions);

        for key in &subjects {
            let Some(state) = self.cache.get(key) else {
                continue;
            };
            if state.is_removed() {
                self.cache.evict(key);
                continue;
            }
            let version = VersionTracker::version_of(&self.schema, state);
            if let Some(state) = self.cache.get_mut(key) {
                state.mark_synchronized(version);
            }
        }

        self.cache.remap(mapping);
        self.log.remap_keys(mapping);
        let flushed: BTreeSet<Key> = subjects.iter().map(|k| mapping.try_remap(k)).collect();
        self.cache.forget_journaled(|k| flushed.contains(k));
        self.tracker.rebuild(&self.schema, &self.cache);
        self.history.merge(mapping)?;
        debug!(
            flushed = batch.len(),
            remaining = self.log.len(),
            "flush absorbed"
        );
        Ok(())
    }

    /// Fetches `key` on a cache miss.
    pub(crate) fn fetch_entity<S: BackingSession + ?Sized>(
        &mut self,
        key: &Key,
        session: &mut S,
    ) -> CoreResult<&EntityState> {
        let key = self.resolve(key);
        if !self.cache.contains(&key) && !key.is_temporary() {
            let fetched = session
                .fetch_by_key(&key)?
                .ok_or_else(|| CoreError::not_found(&key))?;
            self.merge(fetched);
        }
        self.live(&key)
    }

    /// Returns a field, loading it from the store if it is not loaded.
    pub(crate) fn load_field<S: BackingSession + ?Sized>(
        &mut self,
        key: &Key,
        field: FieldId,
        session: &mut S,
    ) -> CoreResult<FieldValue> {
        let key = self.fetch_entity(key, session)?.key().clone();
        self.schema.field(key.type_tag(), field)?;
        if let Some(value) = self.live(&key)?.field(field) {
            return Ok(value.clone());
        }
        if let Some(fetched) = session.fetch_by_key(&key)? {
            self.load_missing(&key, &fetched)?;
        }
        self.live(&key)?
            .field(field)
            .cloned()
            .ok_or_else(|| CoreError::store(format!("store did not return {key}.{field}")))
    }

    /// Runs a query and merges the results.
    pub(crate) fn prefetch_query<S: BackingSession + ?Sized>(
        &mut self,
        query: &Query,
        session: &mut S,
    ) -> CoreResult<Vec<Key>> {
        let query = match query {
            Query::Keys(keys) => Query::Keys(keys.iter().map(|k| self.resolve(k)).collect()),
            Query::Referencing {
                type_tag,
                field,
                target,
            } => Query::Referencing {
                type_tag: *type_tag,
                field: *field,
                target: self.resolve(target),
            },
            other => other.clone(),
        };
        let fetched = session.fetch_by_query(&query)?;
        Ok(self.merge_all(fetched))
    }

    pub(crate) fn merge_all(&mut self, fetched: Vec<EntityState>) -> Vec<Key> {
        let count = fetched.len();
        let keys: Vec<Key> = fetched.into_iter().map(|state| self.merge(state)).collect();
        debug!(count, "merged fetched entities");
        keys
    }

    /// Merges one fetched entity into the cache.
    ///
    /// Unknown entities are inserted. Removed ones are left alone. Loaded
    /// values of modified or new entities are never overwritten; their
    /// missing fields are filled in. Unmodified entities are refreshed
    /// under [`MergeMode::PreferNew`].
    fn merge(&mut self, fetched: EntityState) -> Key {
        let key = fetched.key().clone();
        let existing = self.cache.get(&key).map(EntityState::persistence_state);
        match existing {
            None => {
                self.tracker.index(&self.schema, &fetched);
                self.cache.insert(fetched);
            }
            Some(PersistenceState::Removed) => {}
            Some(PersistenceState::Synchronized)
                if self.config.merge_mode == MergeMode::PreferNew =>
            {
                if let Some(state) = self.cache.get_mut(&key) {
                    state.refresh_from(&fetched);
                }
                if let Some(state) = self.cache.get(&key) {
                    self.tracker.index(&self.schema, state);
                }
            }
            Some(_) => {
                if let Some(state) = self.cache.get_mut(&key) {
                    if state.same_version(&fetched) {
                        state.fill_missing(&fetched);
                    } else {
                        debug!(%key, "store moved past the cached version, fill skipped");
                    }
                }
            }
        }
        key
    }

    /// Fills unloaded fields of `key` from a key fetch. A stale unmodified
    /// entry is refreshed instead; a stale modified one is a conflict.
    fn load_missing(&mut self, key: &Key, fetched: &EntityState) -> CoreResult<()> {
        let Some(state) = self.cache.get(key) else {
            return Ok(());
        };
        if state.same_version(fetched) {
            if let Some(state) = self.cache.get_mut(key) {
                state.fill_missing(fetched);
            }
            return Ok(());
        }
        if state.persistence_state() != PersistenceState::Synchronized {
            return Err(CoreError::VersionConflict {
                conflicts: vec![Conflict {
                    key: key.clone(),
                    expected: state.captured_version().cloned().unwrap_or(VersionInfo::Void),
                    actual: fetched.captured_version().cloned(),
                }],
            });
        }
        if let Some(state) = self.cache.get_mut(key) {
            state.refresh_from(fetched);
        }
        if let Some(state) = self.cache.get(key) {
            self.tracker.index(&self.schema, state);
        }
        Ok(())
    }

    /// Re-reads `keys`, rebasing entities with pending changes onto the
    /// store's current version.
    pub(crate) fn refresh_with<S: BackingSession + ?Sized>(
        &mut self,
        keys: &[Key],
        session: &mut S,
    ) -> CoreResult<Vec<Key>> {
        if !self.scopes.is_empty() {
            return Err(CoreError::invalid_state(
                "cannot refresh inside a transaction scope",
            ));
        }
        let mut refreshed = Vec::with_capacity(keys.len());
        for key in keys {
            let key = self.resolve(key);
            if key.is_temporary() {
                return Err(CoreError::invalid_state(format!(
                    "{key} has not been saved yet"
                )));
            }
            let fetched = session
                .fetch_by_key(&key)?
                .ok_or_else(|| CoreError::not_found(&key))?;
            match self.cache.get(&key).map(EntityState::persistence_state) {
                None => {
                    self.cache.insert(fetched);
                }
                Some(PersistenceState::Synchronized) => {
                    if let Some(state) = self.cache.get_mut(&key) {
                        state.refresh_from(&fetched);
                    }
                }
                Some(_) => self.rebase(&key, &fetched)?,
            }
            if let Some(state) = self.cache.get(&key) {
                self.tracker.index(&self.schema, state);
            }
            refreshed.push(key);
        }
        debug!(count = refreshed.len(), "refreshed from store");
        Ok(refreshed)
    }

    /// Moves a changed entity onto the store's version. Pending values
    /// stay; the version counter restarts from the store's and a new bump
    /// is logged so the replay still advances it.
    fn rebase(&mut self, key: &Key, fetched: &EntityState) -> CoreResult<()> {
        let Some(store_version) = fetched.captured_version().cloned() else {
            return Ok(());
        };
        let Some(state) = self.cache.get(key) else {
            return Ok(());
        };
        if state.same_version(fetched) {
            return Ok(());
        }
        let removed = state.is_removed();
        let version_field = self.schema.type_def(key.type_tag())?.version_field();
        let pending: BTreeSet<FieldId> = self
            .log
            .operations()
            .iter()
            .filter(|op| op.key() == key)
            .filter_map(Operation::field)
            .collect();

        if let Some(state) = self.cache.get_mut(key) {
            state.rebase_onto(fetched, &pending);
        }
        self.log.refresh_base_version(key, store_version.clone());
        if let (Some(field), false) = (version_field, removed) {
            let next = fetched.field(field).and_then(FieldValue::as_integer).unwrap_or(0) + 1;
            if let Some(state) = self.cache.get_mut(key) {
                state.set_value(field, FieldValue::Integer(next));
            }
            self.log.append(Operation::SetField {
                key: key.clone(),
                field,
                value: FieldValue::Integer(next),
            });
        }
        warn!(%key, version = ?store_version, "pending changes rebased onto store version");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema::{RemovalPolicy, Schema, TypeDef};
    use crate::session::MemoryStore;
    use crate::sync::SyncState;
    use dstate_protocol::{FieldId, TypeTag};
    use std::sync::Arc;

    const ITEM: TypeTag = TypeTag::new(1);
    const LINK: TypeTag = TypeTag::new(2);
    const VALUE: FieldId = FieldId::new(0);
    const BODY: FieldId = FieldId::new(1);
    const TARGET: FieldId = FieldId::new(0);

    fn store() -> MemoryStore {
        let schema = Schema::new([
            TypeDef::builder(ITEM, "Item")
                .scalar("Value")
                .lazy_scalar("Body")
                .version_field("Version")
                .build()
                .unwrap(),
            TypeDef::builder(LINK, "Link")
                .reference("Item", ITEM, RemovalPolicy::Clear)
                .build()
                .unwrap(),
        ])
        .unwrap();
        MemoryStore::new(Arc::new(schema))
    }

    #[test]
    fn save_remaps_and_synchronizes() {
        let store = store();
        let mut state = DisconnectedState::new(Arc::clone(store.schema()), Config::default());
        let item = state.create_with(ITEM, vec![(VALUE, "a".into())]).unwrap();
        let link = state.create_with(LINK, vec![(TARGET, item.clone().into())]).unwrap();

        let mut session = store.session();
        let mapping = state.save_changes_with(&mut session).unwrap();
        let item_p = mapping.try_remap(&item);
        let link_p = mapping.try_remap(&link);

        assert!(state.operation_log().is_empty());
        assert_eq!(state.get_persistence_state(&item_p), Some(PersistenceState::Synchronized));
        assert_eq!(state.entity(&link).unwrap().key(), &link_p);
        assert_eq!(store.field(&link_p, TARGET), Some(FieldValue::Ref(item_p.clone())));
        assert_eq!(
            state.entity(&item_p).unwrap().captured_version(),
            store.version_of(&item_p).as_ref()
        );
        assert_eq!(state.sync_state(), SyncState::Committed);
    }

    #[test]
    fn failed_save_leaves_log_and_cache_intact() {
        let store = store();
        let mut state = DisconnectedState::new(Arc::clone(store.schema()), Config::default());
        let item = state.create(ITEM).unwrap();
        store.fail_after(1);

        let before = state.operation_log().len();
        let err = state.save_changes_with(&mut store.session()).unwrap_err();
        assert!(matches!(err, CoreError::ReplayFailed { index: 1, .. }));
        assert_eq!(state.operation_log().len(), before);
        assert_eq!(state.get_persistence_state(&item), Some(PersistenceState::New));
        assert!(store.is_empty());
    }

    #[test]
    fn lazy_fields_load_on_demand() {
        let store = store();
        let item = store
            .seed(ITEM, vec![(VALUE, "a".into()), (BODY, "long".into())])
            .unwrap();
        let mut state = DisconnectedState::new(Arc::clone(store.schema()), Config::default());
        let mut session = store.session();

        let keys = state.prefetch_query(&Query::All(ITEM), &mut session).unwrap();
        assert_eq!(keys, vec![item.clone()]);
        assert!(matches!(
            state.field(&item, BODY),
            Err(CoreError::ConnectionRequired { .. })
        ));
        assert_eq!(
            state.load_field(&item, BODY, &mut session).unwrap(),
            FieldValue::from("long")
        );
        assert_eq!(state.field(&item, BODY).unwrap(), &FieldValue::from("long"));
    }

    #[test]
    fn merge_never_overwrites_local_changes() {
        let store = store();
        let item = store.seed(ITEM, vec![(VALUE, "a".into())]).unwrap();
        let mut state = DisconnectedState::new(Arc::clone(store.schema()), Config::default());
        let mut session = store.session();
        state.fetch_entity(&item, &mut session).unwrap();
        state.set_field(&item, VALUE, "local").unwrap();

        store.external_update(&item, VALUE, "remote".into()).unwrap();
        state.prefetch_query(&Query::Keys(vec![item.clone()]), &mut session).unwrap();
        assert_eq!(state.field(&item, VALUE).unwrap(), &FieldValue::from("local"));
    }

    #[test]
    fn prefer_new_refreshes_unmodified_entities() {
        let store = store();
        let item = store.seed(ITEM, vec![(VALUE, "a".into())]).unwrap();
        let mut session = store.session();

        let mut fresh = DisconnectedState::new(Arc::clone(store.schema()), Config::default());
        let mut stale = DisconnectedState::new(
            Arc::clone(store.schema()),
            Config::default().merge_mode(MergeMode::PreferOriginal),
        );
        fresh.fetch_entity(&item, &mut session).unwrap();
        stale.fetch_entity(&item, &mut session).unwrap();

        store.external_update(&item, VALUE, "b".into()).unwrap();
        let query = Query::Keys(vec![item.clone()]);
        fresh.prefetch_query(&query, &mut session).unwrap();
        stale.prefetch_query(&query, &mut session).unwrap();

        assert_eq!(fresh.field(&item, VALUE).unwrap(), &FieldValue::from("b"));
        assert_eq!(stale.field(&item, VALUE).unwrap(), &FieldValue::from("a"));
    }
}
