//! The disconnected state facade.

mod flush;
mod scope;

pub use scope::{Attached, Connected, TransactionScope};

use crate::config::Config;
use crate::entity::{EntityCache, EntityState, PersistenceState};
use crate::error::{CoreError, CoreResult};
use crate::integrity::RemovalPlanner;
use crate::pin::{PinGuard, PinSet};
use crate::schema::{FieldKind, Schema};
use crate::session::BackingSession;
use crate::sync::{SyncEngine, SyncState, SyncStats};
use crate::version::VersionTracker;
use dstate_protocol::{
    CheckpointId, FieldId, FieldValue, Key, KeyMapping, Operation, OperationLog,
    TemporaryKeyAllocator, TypeTag, VersionInfo,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A working subset of the store, mutated offline and saved later.
///
/// Every mutating call validates first, then updates the cache, appends
/// its operations to the log, and bumps affected versions, all or nothing.
/// Removals run the referential integrity check eagerly. Reads are served
/// from the cache; a miss outside a [`Connected`] scope is a
/// connection-required error.
///
/// Keys handed to any method are resolved through every key mapping this
/// state has produced, so temporary keys kept by the caller stay usable
/// after a save.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use dstate_core::{Config, DisconnectedState, MemoryStore, PersistenceState, Schema, TypeDef};
/// use dstate_protocol::{FieldId, FieldValue, TypeTag};
///
/// let item = TypeDef::builder(TypeTag::new(1), "Item")
///     .scalar("Value")
///     .version_field("Version")
///     .build()
///     .unwrap();
/// let schema = Arc::new(Schema::new([item]).unwrap());
/// let store = MemoryStore::new(Arc::clone(&schema));
///
/// let mut state = DisconnectedState::new(schema, Config::default());
/// let key = state.create_with(TypeTag::new(1), vec![(FieldId::new(0), "v1".into())]).unwrap();
///
/// let mut session = store.session();
/// let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
/// let permanent = mapping.try_remap(&key);
/// assert_eq!(store.field(&permanent, FieldId::new(0)), Some(FieldValue::from("v1")));
/// assert_eq!(state.get_persistence_state(&key), Some(PersistenceState::Synchronized));
/// ```
#[derive(Debug)]
pub struct DisconnectedState {
    schema: Arc<Schema>,
    config: Config,
    cache: EntityCache,
    log: OperationLog,
    tracker: VersionTracker,
    pins: Arc<Mutex<PinSet>>,
    allocator: TemporaryKeyAllocator,
    history: KeyMapping,
    engine: SyncEngine,
    scopes: Vec<CheckpointId>,
    attached: bool,
}

impl DisconnectedState {
    /// Creates an empty disconnected state.
    pub fn new(schema: Arc<Schema>, config: Config) -> Self {
        Self {
            schema,
            config,
            cache: EntityCache::new(),
            log: OperationLog::new(),
            tracker: VersionTracker::new(),
            pins: Arc::new(Mutex::new(PinSet::new())),
            allocator: TemporaryKeyAllocator::new(),
            history: KeyMapping::new(),
            engine: SyncEngine::new(),
            scopes: Vec::new(),
            attached: false,
        }
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the id of the current disconnected cycle.
    pub fn cycle_id(&self) -> Uuid {
        self.log.cycle_id()
    }

    /// Returns true while a session is attached.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Returns the number of open transaction scopes.
    pub fn open_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Returns the number of outstanding pins.
    pub fn pin_count(&self) -> usize {
        self.pins.lock().len()
    }

    /// Maps a possibly superseded temporary key to its permanent key.
    pub fn resolve(&self, key: &Key) -> Key {
        self.history.try_remap(key)
    }

    /// Returns every temporary-to-permanent pair produced so far.
    pub fn key_history(&self) -> &KeyMapping {
        &self.history
    }

    /// Returns the cached state of a live entity.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionRequired` on a cache miss, `EntityNotFound`
    /// for an unknown temporary key, and `InvalidState` if the entity was
    /// removed.
    pub fn entity(&self, key: &Key) -> CoreResult<&EntityState> {
        self.live(&self.resolve(key))
    }

    /// Returns a loaded field of a live entity.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::entity`], plus `ConnectionRequired` if the
    /// field is not loaded.
    pub fn field(&self, key: &Key, field: FieldId) -> CoreResult<&FieldValue> {
        let state = self.entity(key)?;
        self.schema.field(state.type_tag(), field)?;
        state.field(field).ok_or_else(|| {
            CoreError::connection_required(format!("{}.{field} is not loaded", state.key()))
        })
    }

    /// Returns the persistence state of a cached entity.
    pub fn get_persistence_state(&self, key: &Key) -> Option<PersistenceState> {
        self.cache
            .get(&self.resolve(key))
            .map(EntityState::persistence_state)
    }

    /// Returns (key, state) for every cached entity in key order.
    pub fn all_persistence_states(&self) -> Vec<(Key, PersistenceState)> {
        self.cache
            .iter()
            .map(|s| (s.key().clone(), s.persistence_state()))
            .collect()
    }

    /// Returns the keys of every live cached entity of a type.
    pub fn all(&self, type_tag: TypeTag) -> Vec<Key> {
        self.cache.keys_of_type(type_tag)
    }

    /// Returns the captured version of every cached entity the store has
    /// seen.
    pub fn versions(&self) -> BTreeMap<Key, VersionInfo> {
        self.cache
            .iter()
            .filter_map(|s| s.captured_version().map(|v| (s.key().clone(), v.clone())))
            .collect()
    }

    /// Returns the current version stamp of a live entity.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::entity`].
    pub fn version_of(&self, key: &Key) -> CoreResult<VersionInfo> {
        Ok(VersionTracker::version_of(&self.schema, self.entity(key)?))
    }

    /// Returns the operation log of the current cycle.
    pub fn operation_log(&self) -> &OperationLog {
        &self.log
    }

    /// Serializes the operation log for replay elsewhere.
    ///
    /// # Errors
    ///
    /// Fails if a transaction scope is open.
    pub fn export_log(&self) -> CoreResult<Vec<u8>> {
        Ok(self.log.serialize()?)
    }

    /// Returns the state of the last save.
    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    /// Returns replay statistics.
    pub fn sync_stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Creates an entity with a fresh temporary key.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn create(&mut self, type_tag: TypeTag) -> CoreResult<Key> {
        self.create_with(type_tag, Vec::new())
    }

    /// Creates an entity and sets its initial fields in one mutation.
    ///
    /// # Errors
    ///
    /// Fails if the type or a field is unknown or a value does not fit,
    /// and with `ConnectionRequired` if a version root it names, directly
    /// or through another root, is not cached.
    pub fn create_with(
        &mut self,
        type_tag: TypeTag,
        values: Vec<(FieldId, FieldValue)>,
    ) -> CoreResult<Key> {
        self.create_in(type_tag, values, None)
    }

    /// Sets one field.
    ///
    /// # Errors
    ///
    /// Fails if the entity is not live, the field is unknown or a version
    /// field, the value does not fit, or a referenced entity is not live.
    /// Fails with `ConnectionRequired` if a version root of the entity is
    /// not cached; [`Connected::set_field`] fetches it instead.
    pub fn set_field(
        &mut self,
        key: &Key,
        field: FieldId,
        value: impl Into<FieldValue>,
    ) -> CoreResult<()> {
        self.set_fields(key, vec![(field, value.into())])
    }

    /// Sets several fields of one entity with a single version bump.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::set_field`]; nothing is applied on error.
    pub fn set_fields(&mut self, key: &Key, values: Vec<(FieldId, FieldValue)>) -> CoreResult<()> {
        self.set_fields_in(key, values, None)
    }

    /// Adds an item to a collection field. Adding a present item is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if either entity is not live, the field is not a collection
    /// of the item's type, or the collection is not loaded.
    pub fn add_to_collection(&mut self, key: &Key, field: FieldId, item: &Key) -> CoreResult<()> {
        self.add_to_collection_in(key, field, item, None)
    }

    /// Removes an item from a collection field. Removing an absent item is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// As [`DisconnectedState::add_to_collection`].
    pub fn remove_from_collection(
        &mut self,
        key: &Key,
        field: FieldId,
        item: &Key,
    ) -> CoreResult<()> {
        self.remove_from_collection_in(key, field, item, None)
    }

    /// Empties a collection field.
    ///
    /// # Errors
    ///
    /// Fails if the entity is not live, the field is not a collection, or
    /// the collection is not loaded.
    pub fn clear_collection(&mut self, key: &Key, field: FieldId) -> CoreResult<()> {
        self.clear_collection_in(key, field, None)
    }

    /// Removes an entity, applying the removal policies of every
    /// association that points at it.
    ///
    /// # Errors
    ///
    /// Fails with `ReferentialIntegrity` if a `Deny` association still
    /// points at the entity or at anything it cascades to; nothing is
    /// changed in that case.
    pub fn remove(&mut self, key: &Key) -> CoreResult<()> {
        self.remove_with(key, None)
    }

    /// Evicts an unmodified entity from the cache.
    ///
    /// Returns false if the entity was not cached.
    ///
    /// # Errors
    ///
    /// Fails if the entity has pending changes.
    pub fn invalidate(&mut self, key: &Key) -> CoreResult<bool> {
        let key = self.resolve(key);
        match self.cache.get(&key).map(EntityState::persistence_state) {
            None => Ok(false),
            Some(PersistenceState::Synchronized) => {
                self.cache.evict(&key);
                self.tracker.unindex(&key);
                debug!(%key, "invalidated");
                Ok(true)
            }
            Some(state) => Err(CoreError::invalid_state(format!(
                "cannot invalidate {key}: it is {state}"
            ))),
        }
    }

    /// Excludes a live entity, and the New entities only it references,
    /// from flushes until the returned guard is dropped.
    ///
    /// Returns `None` if the entity is already pinned.
    ///
    /// # Errors
    ///
    /// Fails if the entity is not live.
    pub fn pin(&self, key: &Key) -> CoreResult<Option<PinGuard>> {
        let key = self.resolve(key);
        self.live(&key)?;
        if !self.pins.lock().pin(key.clone()) {
            return Ok(None);
        }
        debug!(%key, "pinned");
        Ok(Some(PinGuard::new(Arc::clone(&self.pins), key)))
    }

    /// Opens a transaction scope. See [`TransactionScope`].
    pub fn transaction(&mut self) -> TransactionScope<'_, Self> {
        TransactionScope::open(self)
    }

    /// Binds this state to a live session until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Fails if a session is already attached.
    pub fn attach<'a, S: BackingSession>(
        &'a mut self,
        session: &'a mut S,
    ) -> CoreResult<Attached<'a, S>> {
        if self.attached {
            return Err(CoreError::invalid_state("a session is already attached"));
        }
        self.attached = true;
        debug!(cycle = %self.log.cycle_id(), "attached");
        Ok(Attached::new(self, session))
    }

    pub(crate) fn live(&self, key: &Key) -> CoreResult<&EntityState> {
        match self.cache.get(key) {
            Some(state) if state.is_removed() => {
                Err(CoreError::invalid_state(format!("{key} was removed")))
            }
            Some(state) => Ok(state),
            None if key.is_temporary() => Err(CoreError::not_found(key)),
            None => Err(CoreError::connection_required(format!("{key} is not cached"))),
        }
    }

    fn live_mut(&mut self, key: &Key) -> CoreResult<&mut EntityState> {
        self.live(key)?;
        self.cache
            .get_mut(key)
            .ok_or_else(|| CoreError::not_found(key))
    }

    fn resolve_value(&self, mut value: FieldValue) -> FieldValue {
        value.map_keys(&mut |key: &Key| self.history.get(key).cloned());
        value
    }

    fn user_field(&self, type_tag: TypeTag, field: FieldId) -> CoreResult<FieldKind> {
        let def = self.schema.field(type_tag, field)?;
        if def.kind == FieldKind::Version {
            return Err(CoreError::schema(format!(
                "version field {} is maintained automatically",
                def.name
            )));
        }
        Ok(def.kind)
    }

    fn collection(&self, key: &Key, field: FieldId) -> CoreResult<&[Key]> {
        match self.live(key)?.field(field) {
            Some(FieldValue::Keys(items)) => Ok(items),
            Some(_) => Err(CoreError::schema(format!("{key}.{field} is not a collection"))),
            None => Err(CoreError::connection_required(format!(
                "{key}.{field} is not loaded"
            ))),
        }
    }

    fn collection_target(&self, key: &Key, field: FieldId, item: &Key) -> CoreResult<(Key, Key)> {
        let key = self.resolve(key);
        let item = self.resolve(item);
        let FieldKind::Collection { item: item_tag, .. } = self.user_field(key.type_tag(), field)?
        else {
            return Err(CoreError::schema(format!("{key}.{field} is not a collection")));
        };
        if item.type_tag() != item_tag {
            return Err(CoreError::schema(format!(
                "{key}.{field} holds {item_tag} items, not {}",
                item.type_tag()
            )));
        }
        Ok((key, item))
    }

    pub(crate) fn create_in(
        &mut self,
        type_tag: TypeTag,
        values: Vec<(FieldId, FieldValue)>,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<Key> {
        self.schema.type_def(type_tag)?;
        let key = self.allocator.allocate(type_tag);
        let mut operations = vec![Operation::CreateEntity {
            key: key.clone(),
            type_tag,
        }];
        for (field, value) in values {
            self.user_field(type_tag, field)?;
            operations.push(Operation::SetField {
                key: key.clone(),
                field,
                value: self.resolve_value(value),
            });
        }
        self.commit_batch(Vec::new(), operations, session)?;
        Ok(key)
    }

    pub(crate) fn set_fields_in(
        &mut self,
        key: &Key,
        values: Vec<(FieldId, FieldValue)>,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        let key = self.resolve(key);
        self.live(&key)?;
        let mut operations = Vec::with_capacity(values.len());
        for (field, value) in values {
            self.user_field(key.type_tag(), field)?;
            operations.push(Operation::SetField {
                key: key.clone(),
                field,
                value: self.resolve_value(value),
            });
        }
        self.commit_batch(Vec::new(), operations, session)
    }

    pub(crate) fn add_to_collection_in(
        &mut self,
        key: &Key,
        field: FieldId,
        item: &Key,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        let (key, item) = self.collection_target(key, field, item)?;
        if self.collection(&key, field)?.contains(&item) {
            return Ok(());
        }
        self.commit_batch(
            Vec::new(),
            vec![Operation::CollectionAdd { key, field, item }],
            session,
        )
    }

    pub(crate) fn remove_from_collection_in(
        &mut self,
        key: &Key,
        field: FieldId,
        item: &Key,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        let (key, item) = self.collection_target(key, field, item)?;
        if !self.collection(&key, field)?.contains(&item) {
            return Ok(());
        }
        self.commit_batch(
            Vec::new(),
            vec![Operation::CollectionRemove { key, field, item }],
            session,
        )
    }

    pub(crate) fn clear_collection_in(
        &mut self,
        key: &Key,
        field: FieldId,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        let key = self.resolve(key);
        if !matches!(
            self.user_field(key.type_tag(), field)?,
            FieldKind::Collection { .. }
        ) {
            return Err(CoreError::schema(format!("{key}.{field} is not a collection")));
        }
        if self.collection(&key, field)?.is_empty() {
            return Ok(());
        }
        self.commit_batch(
            Vec::new(),
            vec![Operation::CollectionClear { key, field }],
            session,
        )
    }

    pub(crate) fn remove_with(
        &mut self,
        key: &Key,
        mut session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        let key = self.resolve(key);
        self.live(&key)?;
        let plan = RemovalPlanner::new(
            &self.schema,
            &self.cache,
            &self.config,
            session.as_deref_mut(),
        )
        .plan(&key)?;
        debug!(
            %key,
            removed = plan.removed.len(),
            operations = plan.operations.len(),
            "removal planned"
        );
        self.commit_batch(plan.fetched, plan.operations, session)
    }

    /// Applies a batch atomically: cache first, then version bumps, then the
    /// log. On error the cache is restored and nothing is logged.
    ///
    /// Every version root of a touched entity must be cached so its bump
    /// reaches the store. Missing roots are fetched through `session` when
    /// one is given.
    fn commit_batch(
        &mut self,
        preload: Vec<EntityState>,
        operations: Vec<Operation>,
        session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let subjects: BTreeSet<Key> = operations.iter().map(|op| op.key().clone()).collect();
        // Roots named before the change bump too, so a moved dependent
        // bumps both its old and new root.
        let mut bumped: BTreeSet<Key> = subjects
            .iter()
            .flat_map(|key| self.tracker.transitive_roots(key))
            .collect();

        // Initial values of an entity created in this batch keep it New.
        let created: BTreeSet<Key> = operations
            .iter()
            .filter_map(|op| match op {
                Operation::CreateEntity { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();

        self.cache.begin_journal();
        for state in preload {
            self.cache.insert(state);
        }
        for op in &operations {
            if let Err(e) = self.apply_to_cache(op, &created) {
                self.cache.rollback_journal();
                self.tracker.rebuild(&self.schema, &self.cache);
                return Err(e);
            }
        }
        self.tracker.rebuild(&self.schema, &self.cache);

        for key in &subjects {
            bumped.extend(self.tracker.transitive_roots(key));
        }
        bumped.extend(subjects);
        if let Err(e) = self.load_roots(&mut bumped, session) {
            self.cache.rollback_journal();
            self.tracker.rebuild(&self.schema, &self.cache);
            return Err(e);
        }
        let bumps = VersionTracker::bump_operations(&self.schema, &self.cache, &bumped);
        for bump in &bumps {
            if let Operation::SetField { key, field, value } = bump {
                if let Some(state) = self.cache.get_mut(key) {
                    state.set_value(*field, value.clone());
                    if state.persistence_state() == PersistenceState::Synchronized {
                        state.mark_modified();
                    }
                }
            }
        }
        self.cache.commit_journal();

        debug!(
            operations = operations.len(),
            bumps = bumps.len(),
            "mutation accepted"
        );
        for op in operations.into_iter().chain(bumps) {
            let key = op.key();
            if let Some(version) = self.cache.get(key).and_then(EntityState::captured_version) {
                self.log.record_base_version(key.clone(), version.clone());
            }
            self.log.append(op);
        }
        Ok(())
    }

    /// Caches every key in `bumped`, adding the roots of fetched roots.
    fn load_roots(
        &mut self,
        bumped: &mut BTreeSet<Key>,
        mut session: Option<&mut (dyn BackingSession + '_)>,
    ) -> CoreResult<()> {
        loop {
            let missing: Vec<Key> = bumped
                .iter()
                .filter(|key| !self.cache.contains(key))
                .cloned()
                .collect();
            let Some(first) = missing.first() else {
                return Ok(());
            };
            let Some(live) = session.as_deref_mut() else {
                return Err(CoreError::connection_required(format!(
                    "version root {first} is not cached"
                )));
            };
            for key in &missing {
                let fetched = live
                    .fetch_by_key(key)?
                    .ok_or_else(|| CoreError::not_found(key))?;
                debug!(%key, "version root fetched");
                self.cache.insert(fetched);
            }
            self.tracker.rebuild(&self.schema, &self.cache);
            let reachable: Vec<Key> = missing
                .iter()
                .flat_map(|key| self.tracker.transitive_roots(key))
                .collect();
            bumped.extend(reachable);
        }
    }

    fn apply_to_cache(
        &mut self,
        op: &Operation,
        created: &BTreeSet<Key>,
    ) -> CoreResult<()> {
        let schema = Arc::clone(&self.schema);
        match op {
            Operation::CreateEntity { key, type_tag } => {
                let def = schema.type_def(*type_tag)?;
                if self.cache.contains(key) {
                    return Err(CoreError::invalid_state(format!("{key} already exists")));
                }
                self.allocator.observe(key);
                self.cache.insert(EntityState::created(def, key.clone()));
            }
            Operation::RemoveEntity { key } => {
                self.live_mut(key)?.mark_removed();
            }
            Operation::SetField { key, field, value } => {
                schema.field(key.type_tag(), *field)?.check_assignable(value)?;
                for target in value.referenced_keys() {
                    self.live(target)?;
                }
                let state = self.live_mut(key)?;
                state.set_value(*field, value.clone());
                if !created.contains(key) {
                    state.mark_modified();
                }
            }
            Operation::CollectionAdd { key, field, item } => {
                self.live(item)?;
                let state = self.live_mut(key)?;
                let items = collection_items(state, *field)?;
                if !items.contains(item) {
                    items.push(item.clone());
                }
                if !created.contains(key) {
                    state.mark_modified();
                }
            }
            Operation::CollectionRemove { key, field, item } => {
                let state = self.live_mut(key)?;
                collection_items(state, *field)?.retain(|k| k != item);
                if !created.contains(key) {
                    state.mark_modified();
                }
            }
            Operation::CollectionClear { key, field } => {
                let state = self.live_mut(key)?;
                collection_items(state, *field)?.clear();
                if !created.contains(key) {
                    state.mark_modified();
                }
            }
        }
        Ok(())
    }

    pub(crate) fn open_scope(&mut self) -> CheckpointId {
        let checkpoint = self.log.checkpoint();
        self.cache.begin_journal();
        self.scopes.push(checkpoint);
        debug!(depth = self.scopes.len(), "transaction scope opened");
        checkpoint
    }

    pub(crate) fn ensure_unpinned(&self) -> CoreResult<()> {
        let pins = self.pins.lock().len();
        if pins > 0 {
            return Err(CoreError::invalid_state(format!(
                "{pins} entit(ies) still pinned"
            )));
        }
        Ok(())
    }

    pub(crate) fn close_scope(&mut self, checkpoint: CheckpointId, keep: bool) -> CoreResult<()> {
        if self.scopes.last() != Some(&checkpoint) {
            return Err(CoreError::invalid_state(
                "transaction scopes must close innermost first",
            ));
        }
        self.scopes.pop();
        if keep {
            self.log.release(checkpoint)?;
            self.cache.commit_journal();
            debug!(depth = self.scopes.len(), "transaction scope completed");
        } else {
            let dropped = self.log.rollback_to(checkpoint)?;
            let restored = self.cache.rollback_journal();
            self.tracker.rebuild(&self.schema, &self.cache);
            debug!(
                depth = self.scopes.len(),
                dropped = dropped.len(),
                restored,
                "transaction scope rolled back"
            );
        }
        Ok(())
    }
}

impl AsMut<DisconnectedState> for DisconnectedState {
    fn as_mut(&mut self) -> &mut DisconnectedState {
        self
    }
}

fn collection_items(state: &mut EntityState, field: FieldId) -> CoreResult<&mut Vec<Key>> {
    let key = state.key().clone();
    match state.value_mut(field) {
        Some(FieldValue::Keys(items)) => Ok(items),
        Some(_) => Err(CoreError::schema(format!("{key}.{field} is not a collection"))),
        None => Err(CoreError::connection_required(format!(
            "{key}.{field} is not loaded"
        ))),
    }
}
