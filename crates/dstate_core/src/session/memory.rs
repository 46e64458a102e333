//! In-memory backing store for tests and embedding.

use super::{BackingSession, Query};
use crate::entity::EntityState;
use crate::error::{CoreError, CoreResult};
use crate::schema::{FieldKind, Schema, TypeDef};
use dstate_protocol::{FieldId, FieldValue, Key, Operation, TypeTag, VersionInfo};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<Key, Vec<FieldValue>>,
    next_ids: BTreeMap<TypeTag, i64>,
}

impl Tables {
    fn allocate(&mut self, type_tag: TypeTag) -> Key {
        let next = self.next_ids.entry(type_tag).or_insert(0);
        *next += 1;
        Key::from_id(type_tag, *next)
    }

    fn observe(&mut self, key: &Key) {
        if let [FieldValue::Integer(n)] = key.values() {
            let next = self.next_ids.entry(key.type_tag()).or_insert(0);
            *next = (*next).max(*n);
        }
    }

    fn row_mut(&mut self, key: &Key) -> CoreResult<&mut Vec<FieldValue>> {
        self.rows
            .get_mut(key)
            .ok_or_else(|| CoreError::store(format!("entity {key} does not exist")))
    }

    fn referenced_by(&self, target: &Key) -> Option<(Key, FieldId)> {
        self.rows.iter().filter(|(key, _)| *key != target).find_map(|(key, row)| {
            row.iter().position(|v| v.references(target)).map(|i| {
                (key.clone(), FieldId::new(u16::try_from(i).unwrap_or(u16::MAX)))
            })
        })
    }

    fn check_targets_exist(&self, value: &FieldValue) -> CoreResult<()> {
        for key in value.referenced_keys() {
            if !self.rows.contains_key(key) {
                return Err(CoreError::store(format!("dangling reference to {key}")));
            }
        }
        Ok(())
    }

    fn collection<'a>(
        &'a mut self,
        schema: &Schema,
        key: &Key,
        field: FieldId,
    ) -> CoreResult<&'a mut Vec<Key>> {
        let def = schema.field(key.type_tag(), field)?;
        if !matches!(def.kind, FieldKind::Collection { .. }) {
            return Err(CoreError::store(format!("{key}.{field} is not a collection")));
        }
        let row = self.row_mut(key)?;
        let slot = row
            .get_mut(field.index())
            .ok_or_else(|| CoreError::store(format!("{key} has no field {field}")))?;
        if !matches!(slot, FieldValue::Keys(_)) {
            *slot = FieldValue::Keys(Vec::new());
        }
        match slot {
            FieldValue::Keys(keys) => Ok(keys),
            _ => Err(CoreError::store(format!("{key}.{field} is not a collection"))),
        }
    }

    fn apply(&mut self, schema: &Schema, operation: &Operation) -> CoreResult<()> {
        if let Some(temp) = operation.touched_keys().into_iter().find(|k| k.is_temporary()) {
            return Err(CoreError::store(format!(
                "temporary key {temp} cannot be stored"
            )));
        }
        match operation {
            Operation::CreateEntity { key, type_tag } => {
                if key.type_tag() != *type_tag {
                    return Err(CoreError::store(format!(
                        "key {key} does not belong to type {type_tag}"
                    )));
                }
                if self.rows.contains_key(key) {
                    return Err(CoreError::store(format!("entity {key} already exists")));
                }
                let def = schema.type_def(*type_tag)?;
                self.observe(key);
                self.rows.insert(key.clone(), def.initial_values());
            }
            Operation::RemoveEntity { key } => {
                if !self.rows.contains_key(key) {
                    return Err(CoreError::store(format!("entity {key} does not exist")));
                }
                if let Some((by, field)) = self.referenced_by(key) {
                    return Err(CoreError::store(format!(
                        "entity {key} is still referenced by {by}.{field}"
                    )));
                }
                self.rows.remove(key);
            }
            Operation::SetField { key, field, value } => {
                let def = schema.field(key.type_tag(), *field)?;
                if !matches!(def.kind, FieldKind::Version) {
                    def.check_assignable(value)
                        .map_err(|e| CoreError::store(e.to_string()))?;
                }
                self.check_targets_exist(value)?;
                let row = self.row_mut(key)?;
                match row.get_mut(field.index()) {
                    Some(slot) => *slot = value.clone(),
                    None => return Err(CoreError::store(format!("{key} has no field {field}"))),
                }
            }
            Operation::CollectionAdd { key, field, item } => {
                if !self.rows.contains_key(item) {
                    return Err(CoreError::store(format!("dangling reference to {item}")));
                }
                let items = self.collection(schema, key, *field)?;
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
            Operation::CollectionRemove { key, field, item } => {
                self.collection(schema, key, *field)?.retain(|k| k != item);
            }
            Operation::CollectionClear { key, field } => {
                self.collection(schema, key, *field)?.clear();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreData {
    tables: Tables,
    fail_after: Option<usize>,
    executed: u64,
}

/// Authoritative in-memory store.
///
/// Cloning a `MemoryStore` yields another handle to the same data. Each
/// [`MemorySession`] opened on it implements [`BackingSession`] with
/// snapshot-based transactions. The store rejects operations that would
/// leave dangling references, and can simulate concurrent writers and
/// injected failures.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use dstate_core::{MemoryStore, Schema, TypeDef};
/// use dstate_protocol::{FieldId, FieldValue, TypeTag};
///
/// let def = TypeDef::builder(TypeTag::new(1), "Note").scalar("Text").build().unwrap();
/// let store = MemoryStore::new(Arc::new(Schema::new([def]).unwrap()));
/// let key = store.seed(TypeTag::new(1), vec![(FieldId::new(0), FieldValue::from("hi"))]).unwrap();
/// assert_eq!(store.field(&key, FieldId::new(0)), Some(FieldValue::from("hi")));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    schema: Arc<Schema>,
    data: Arc<RwLock<StoreData>>,
}

impl MemoryStore {
    /// Creates an empty store for `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            data: Arc::new(RwLock::new(StoreData::default())),
        }
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Opens a session on this store.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            snapshot: None,
        }
    }

    /// Inserts an entity outside any transaction and returns its key.
    ///
    /// Versionable entities start at version 1.
    ///
    /// # Errors
    ///
    /// Fails on unknown types or fields, or dangling references.
    pub fn seed(&self, type_tag: TypeTag, values: Vec<(FieldId, FieldValue)>) -> CoreResult<Key> {
        let def = self.schema.type_def(type_tag)?;
        let mut row = def.initial_values();
        let mut data = self.data.write();
        for (field, value) in values {
            let field_def = self.schema.field(type_tag, field)?;
            let seeds_collection = matches!(
                (&field_def.kind, &value),
                (FieldKind::Collection { .. }, FieldValue::Keys(_))
            );
            if !seeds_collection {
                field_def.check_assignable(&value)?;
            }
            data.tables.check_targets_exist(&value)?;
            row[field.index()] = value;
        }
        if let Some(version) = def.version_field() {
            row[version.index()] = FieldValue::Integer(1);
        }
        let key = data.tables.allocate(type_tag);
        data.tables.rows.insert(key.clone(), row);
        Ok(key)
    }

    /// Returns a copy of an entity's fields.
    pub fn row(&self, key: &Key) -> Option<Vec<FieldValue>> {
        self.data.read().tables.rows.get(key).cloned()
    }

    /// Returns one field of an entity.
    pub fn field(&self, key: &Key, field: FieldId) -> Option<FieldValue> {
        self.data
            .read()
            .tables
            .rows
            .get(key)
            .and_then(|row| row.get(field.index()).cloned())
    }

    /// Returns true if the entity exists.
    pub fn contains(&self, key: &Key) -> bool {
        self.data.read().tables.rows.contains_key(key)
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.data.read().tables.rows.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the keys of every entity of a type.
    pub fn keys_of_type(&self, type_tag: TypeTag) -> Vec<Key> {
        self.data
            .read()
            .tables
            .rows
            .keys()
            .filter(|k| k.type_tag() == type_tag)
            .cloned()
            .collect()
    }

    /// Returns the store's current version stamp of an entity.
    pub fn version_of(&self, key: &Key) -> Option<VersionInfo> {
        let data = self.data.read();
        let row = data.tables.rows.get(key)?;
        let def = self.schema.get(key.type_tag())?;
        Some(row_version(def, row))
    }

    /// Simulates another writer changing a field, bumping the version.
    ///
    /// # Errors
    ///
    /// Fails if the entity or field does not exist or the value does not fit.
    pub fn external_update(&self, key: &Key, field: FieldId, value: FieldValue) -> CoreResult<()> {
        let def = self.schema.type_def(key.type_tag())?;
        let mut data = self.data.write();
        data.tables.apply(
            &self.schema,
            &Operation::SetField {
                key: key.clone(),
                field,
                value,
            },
        )?;
        if let Some(version) = def.version_field() {
            let row = data.tables.row_mut(key)?;
            let next = row[version.index()].as_integer().unwrap_or(0) + 1;
            row[version.index()] = FieldValue::Integer(next);
        }
        Ok(())
    }

    /// Simulates another writer removing an entity.
    ///
    /// # Errors
    ///
    /// Fails if the entity does not exist or is still referenced.
    pub fn external_remove(&self, key: &Key) -> CoreResult<()> {
        self.data
            .write()
            .tables
            .apply(&self.schema, &Operation::RemoveEntity { key: key.clone() })
    }

    /// Makes operation number `n + 1` executed from now on fail.
    pub fn fail_after(&self, n: usize) {
        self.data.write().fail_after = Some(n);
    }

    /// Returns the number of operations executed successfully so far.
    pub fn executed_operations(&self) -> u64 {
        self.data.read().executed
    }

    fn state_of(&self, key: &Key, row: &[FieldValue], load_lazy: bool) -> Option<EntityState> {
        let def = self.schema.get(key.type_tag())?;
        let fields = def
            .fields()
            .iter()
            .map(|field| {
                if field.lazy && !load_lazy {
                    None
                } else {
                    row.get(field.id.index()).cloned()
                }
            })
            .collect();
        Some(EntityState::synchronized(
            key.clone(),
            fields,
            row_version(def, row),
        ))
    }
}

fn row_version(def: &TypeDef, row: &[FieldValue]) -> VersionInfo {
    def.version_info(|id| row.get(id.index()))
}

/// Session on a [`MemoryStore`].
///
/// Dropping a session with an open transaction rolls it back.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    snapshot: Option<Tables>,
}

impl MemorySession {
    /// Returns the store this session is bound to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Returns true if a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl BackingSession for MemorySession {
    fn fetch_by_key(&mut self, key: &Key) -> CoreResult<Option<EntityState>> {
        let data = self.store.data.read();
        Ok(data
            .tables
            .rows
            .get(key)
            .and_then(|row| self.store.state_of(key, row, true)))
    }

    fn fetch_by_query(&mut self, query: &Query) -> CoreResult<Vec<EntityState>> {
        let data = self.store.data.read();
        let rows = &data.tables.rows;
        let states = match query {
            Query::All(tag) => {
                self.store.schema.type_def(*tag)?;
                rows.iter()
                    .filter(|(key, _)| key.type_tag() == *tag)
                    .filter_map(|(key, row)| self.store.state_of(key, row, false))
                    .collect()
            }
            Query::Keys(keys) => keys
                .iter()
                .filter_map(|key| {
                    rows.get(key)
                        .and_then(|row| self.store.state_of(key, row, false))
                })
                .collect(),
            Query::Referencing {
                type_tag,
                field,
                target,
            } => rows
                .iter()
                .filter(|(key, _)| key.type_tag() == *type_tag)
                .filter(|(_, row)| row.get(field.index()).is_some_and(|v| v.references(target)))
                .filter_map(|(key, row)| self.store.state_of(key, row, false))
                .collect(),
        };
        Ok(states)
    }

    fn begin_transaction(&mut self) -> CoreResult<()> {
        if self.snapshot.is_some() {
            return Err(CoreError::store("transaction already open"));
        }
        self.snapshot = Some(self.store.data.read().tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> CoreResult<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| CoreError::store("no open transaction"))
    }

    fn rollback(&mut self) -> CoreResult<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| CoreError::store("no open transaction"))?;
        self.store.data.write().tables = snapshot;
        Ok(())
    }

    fn allocate_permanent_key(&mut self, type_tag: TypeTag) -> CoreResult<Key> {
        self.store.schema.type_def(type_tag)?;
        Ok(self.store.data.write().tables.allocate(type_tag))
    }

    fn current_version_of(&mut self, key: &Key) -> CoreResult<Option<VersionInfo>> {
        Ok(self.store.version_of(key))
    }

    fn execute_operation(&mut self, operation: &Operation) -> CoreResult<()> {
        if self.snapshot.is_none() {
            return Err(CoreError::store("operations require an open transaction"));
        }
        let mut data = self.store.data.write();
        let fail_after = data.fail_after;
        match fail_after {
            Some(0) => {
                data.fail_after = None;
                return Err(CoreError::store(format!("injected failure at {operation}")));
            }
            Some(n) => data.fail_after = Some(n - 1),
            None => {}
        }
        data.tables.apply(&self.store.schema, operation)?;
        data.executed += 1;
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            tracing::warn!("memory session dropped with an open transaction; rolling back");
            self.store.data.write().tables = snapshot;
        }
    }
}
