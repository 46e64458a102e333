//! Entity state cache with nested undo journals.

use super::state::EntityState;
use dstate_protocol::{FieldId, Key, KeyMapping, TypeTag};
use std::collections::BTreeMap;

/// First-touch pre-images recorded while a journal is open.
///
/// `None` means the key was absent before it was touched.
type Journal = BTreeMap<Key, Option<EntityState>>;

/// Map from key to cached entity state.
///
/// Every write goes through [`EntityCache::insert`], [`EntityCache::get_mut`]
/// or [`EntityCache::evict`], which record the entry's pre-image in the
/// innermost open journal the first time it is touched. Rolling a journal
/// back restores exactly those pre-images; committing it hands them to the
/// enclosing journal.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: BTreeMap<Key, EntityState>,
    journals: Vec<Journal>,
}

impl EntityCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of cached entities, removed ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached state of `key`.
    pub fn get(&self, key: &Key) -> Option<&EntityState> {
        self.entries.get(key)
    }

    /// Returns true if `key` is cached.
    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates cached states in key order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityState> {
        self.entries.values()
    }

    /// Returns the keys of live entities of a type.
    pub fn keys_of_type(&self, tag: TypeTag) -> Vec<Key> {
        self.entries
            .values()
            .filter(|s| s.type_tag() == tag && !s.is_removed())
            .map(|s| s.key().clone())
            .collect()
    }

    /// Returns (referencing key, field) for every live entity whose loaded
    /// fields point at `target`.
    pub fn referencers(&self, target: &Key) -> Vec<(Key, FieldId)> {
        self.entries
            .values()
            .filter(|s| !s.is_removed() && s.key() != target)
            .flat_map(|s| {
                s.fields_referencing(target)
                    .into_iter()
                    .map(move |field| (s.key().clone(), field))
            })
            .collect()
    }

    fn record(&mut self, key: &Key) {
        if let Some(journal) = self.journals.last_mut() {
            if !journal.contains_key(key) {
                journal.insert(key.clone(), self.entries.get(key).cloned());
            }
        }
    }

    /// Inserts or replaces a state, returning the previous one.
    pub fn insert(&mut self, state: EntityState) -> Option<EntityState> {
        let key = state.key().clone();
        self.record(&key);
        self.entries.insert(key, state)
    }

    /// Returns a mutable reference to a cached state.
    pub fn get_mut(&mut self, key: &Key) -> Option<&mut EntityState> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.record(key);
        self.entries.get_mut(key)
    }

    /// Removes a state from the cache.
    pub fn evict(&mut self, key: &Key) -> Option<EntityState> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.record(key);
        self.entries.remove(key)
    }

    /// Opens a journal.
    pub fn begin_journal(&mut self) {
        self.journals.push(Journal::new());
    }

    /// Returns the number of open journals.
    pub fn journal_depth(&self) -> usize {
        self.journals.len()
    }

    /// Closes the innermost journal, keeping its changes.
    pub fn commit_journal(&mut self) {
        let Some(journal) = self.journals.pop() else {
            return;
        };
        if let Some(parent) = self.journals.last_mut() {
            for (key, pre_image) in journal {
                parent.entry(key).or_insert(pre_image);
            }
        }
    }

    /// Closes the innermost journal, restoring every entry it touched.
    ///
    /// Returns the number of restored entries.
    pub fn rollback_journal(&mut self) -> usize {
        let Some(journal) = self.journals.pop() else {
            return 0;
        };
        let restored = journal.len();
        for (key, pre_image) in journal {
            match pre_image {
                Some(state) => {
                    self.entries.insert(key, state);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
        restored
    }

    /// Drops journaled pre-images whose key matches `forget`.
    ///
    /// Entries written to the store can no longer be rolled back locally.
    pub fn forget_journaled(&mut self, mut forget: impl FnMut(&Key) -> bool) {
        for journal in &mut self.journals {
            journal.retain(|key, _| !forget(key));
        }
    }

    /// Rewrites every key, in entries and journals, through `mapping`.
    pub fn remap(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries
            .into_values()
            .map(|mut state| {
                state.remap(mapping);
                (state.key().clone(), state)
            })
            .collect();

        for journal in &mut self.journals {
            let old = std::mem::take(journal);
            *journal = old
                .into_iter()
                .map(|(key, mut pre_image)| {
                    if let Some(state) = pre_image.as_mut() {
                        state.remap(mapping);
                    }
                    (mapping.try_remap(&key), pre_image)
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PersistenceState;
    use dstate_protocol::{FieldValue, VersionInfo};

    fn synced(id: i64, name: &str) -> EntityState {
        EntityState::synchronized(
            Key::from_id(TypeTag::new(1), id),
            vec![Some(FieldValue::from(name)), Some(FieldValue::Null)],
            VersionInfo::Void,
        )
    }

    fn key(id: i64) -> Key {
        Key::from_id(TypeTag::new(1), id)
    }

    #[test]
    fn rollback_restores_pre_images() {
        let mut cache = EntityCache::new();
        cache.insert(synced(1, "a"));

        cache.begin_journal();
        cache
            .get_mut(&key(1))
            .unwrap()
            .set_value(FieldId::new(0), FieldValue::from("b"));
        cache.get_mut(&key(1)).unwrap().mark_modified();
        cache.insert(synced(2, "new"));
        assert_eq!(cache.rollback_journal(), 2);

        let state = cache.get(&key(1)).unwrap();
        assert_eq!(state.field(FieldId::new(0)), Some(&FieldValue::from("a")));
        assert_eq!(state.persistence_state(), PersistenceState::Synchronized);
        assert!(!cache.contains(&key(2)));
    }

    #[test]
    fn nested_commit_folds_into_parent() {
        let mut cache = EntityCache::new();
        cache.insert(synced(1, "a"));

        cache.begin_journal();
        cache.begin_journal();
        cache.evict(&key(1));
        cache.commit_journal();
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.journal_depth(), 1);

        cache.rollback_journal();
        assert!(cache.contains(&key(1)));
    }

    #[test]
    fn referencers_skip_removed_entities() {
        let mut cache = EntityCache::new();
        let mut holder = synced(1, "holder");
        holder.set_value(FieldId::new(1), FieldValue::Ref(key(3)));
        let mut removed = synced(2, "gone");
        removed.set_value(FieldId::new(1), FieldValue::Ref(key(3)));
        removed.mark_removed();
        cache.insert(holder);
        cache.insert(removed);
        cache.insert(synced(3, "target"));

        assert_eq!(cache.referencers(&key(3)), vec![(key(1), FieldId::new(1))]);
        assert_eq!(cache.keys_of_type(TypeTag::new(1)), vec![key(1), key(3)]);
    }

    #[test]
    fn remap_rewrites_entries_and_journals() {
        let temp = Key::temporary(TypeTag::new(1), vec![FieldValue::Integer(1)]);
        let mut cache = EntityCache::new();
        cache.begin_journal();
        let mut holder = synced(5, "holder");
        holder.set_value(FieldId::new(1), FieldValue::Ref(temp.clone()));
        cache.insert(holder);
        cache.insert(EntityState::synchronized(temp.clone(), vec![], VersionInfo::Void));

        let mut mapping = KeyMapping::new();
        mapping.insert(temp.clone(), key(9)).unwrap();
        cache.remap(&mapping);

        assert!(cache.contains(&key(9)));
        assert!(!cache.contains(&temp));
        assert_eq!(
            cache.get(&key(5)).unwrap().field(FieldId::new(1)),
            Some(&FieldValue::Ref(key(9)))
        );
        cache.rollback_journal();
        assert!(cache.is_empty());
    }
}
