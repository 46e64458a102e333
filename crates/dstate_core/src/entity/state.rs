//! Cached entity state.

use crate::schema::TypeDef;
use dstate_protocol::{FieldId, FieldValue, Key, KeyMapping, TypeTag, VersionInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Persistence state of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Created in this cycle and not yet changed.
    New,
    /// Changed since it was created or fetched.
    Modified,
    /// Matches the store.
    Synchronized,
    /// Removed in this cycle. Terminal.
    Removed,
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistenceState::New => "new",
            PersistenceState::Modified => "modified",
            PersistenceState::Synchronized => "synchronized",
            PersistenceState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Cached, partially populated representation of one entity.
///
/// The field tuple is sparse: each slot is either available (`Some`) or
/// not loaded (`None`). Slot positions are the type's [`FieldId`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    key: Key,
    fields: Vec<Option<FieldValue>>,
    state: PersistenceState,
    captured_version: Option<VersionInfo>,
}

impl EntityState {
    /// Creates the state of a freshly created entity.
    pub fn created(def: &TypeDef, key: Key) -> Self {
        Self {
            key,
            fields: def.initial_values().into_iter().map(Some).collect(),
            state: PersistenceState::New,
            captured_version: None,
        }
    }

    /// Creates the state of an entity read from the store.
    pub fn synchronized(key: Key, fields: Vec<Option<FieldValue>>, version: VersionInfo) -> Self {
        Self {
            key,
            fields,
            state: PersistenceState::Synchronized,
            captured_version: Some(version),
        }
    }

    /// Returns the key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns the type tag.
    pub fn type_tag(&self) -> TypeTag {
        self.key.type_tag()
    }

    /// Returns the persistence state.
    pub fn persistence_state(&self) -> PersistenceState {
        self.state
    }

    /// Returns true if the entity was removed in this cycle.
    pub fn is_removed(&self) -> bool {
        self.state == PersistenceState::Removed
    }

    /// Returns a field value, or `None` if the field is not loaded.
    pub fn field(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields.get(id.index()).and_then(Option::as_ref)
    }

    /// Returns true if the field is loaded.
    pub fn is_available(&self, id: FieldId) -> bool {
        self.field(id).is_some()
    }

    /// Returns the sparse field tuple.
    pub fn fields(&self) -> &[Option<FieldValue>] {
        &self.fields
    }

    /// Returns the version captured when the entity was fetched or last
    /// saved. `None` for entities the store has not seen yet.
    pub fn captured_version(&self) -> Option<&VersionInfo> {
        self.captured_version.as_ref()
    }

    /// Returns every (field, key) reference held by loaded fields.
    pub fn references(&self) -> Vec<(FieldId, &Key)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i, value)))
            .flat_map(|(i, value)| {
                let id = FieldId::new(u16::try_from(i).unwrap_or(u16::MAX));
                value.referenced_keys().into_iter().map(move |key| (id, key))
            })
            .collect()
    }

    /// Returns the loaded fields that point at `target`.
    pub fn fields_referencing(&self, target: &Key) -> Vec<FieldId> {
        let mut fields: Vec<FieldId> = self
            .references()
            .into_iter()
            .filter(|(_, key)| *key == target)
            .map(|(field, _)| field)
            .collect();
        fields.dedup();
        fields
    }

    pub(crate) fn set_value(&mut self, id: FieldId, value: FieldValue) {
        if self.fields.len() <= id.index() {
            self.fields.resize(id.index() + 1, None);
        }
        self.fields[id.index()] = Some(value);
    }

    pub(crate) fn value_mut(&mut self, id: FieldId) -> Option<&mut FieldValue> {
        self.fields.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn mark_modified(&mut self) {
        if matches!(
            self.state,
            PersistenceState::New | PersistenceState::Synchronized
        ) {
            self.state = PersistenceState::Modified;
        }
    }

    pub(crate) fn mark_removed(&mut self) {
        self.state = PersistenceState::Removed;
    }

    pub(crate) fn mark_synchronized(&mut self, version: VersionInfo) {
        self.state = PersistenceState::Synchronized;
        self.captured_version = Some(version);
    }

    /// Fills slots that are unavailable here from `other`.
    pub(crate) fn fill_missing(&mut self, other: &EntityState) {
        for (i, slot) in other.fields.iter().enumerate() {
            if let Some(value) = slot {
                if self.fields.get(i).map_or(true, Option::is_none) {
                    self.set_value(FieldId::new(u16::try_from(i).unwrap_or(u16::MAX)), value.clone());
                }
            }
        }
    }

    /// Overwrites every slot `other` has loaded and adopts its version.
    pub(crate) fn refresh_from(&mut self, other: &EntityState) {
        for (i, slot) in other.fields.iter().enumerate() {
            if let Some(value) = slot {
                self.set_value(FieldId::new(u16::try_from(i).unwrap_or(u16::MAX)), value.clone());
            }
        }
        if let Some(version) = &other.captured_version {
            self.captured_version = Some(version.clone());
        }
    }

    /// Takes `other`'s loaded values for every field not in `pending` and
    /// adopts its version.
    pub(crate) fn rebase_onto(&mut self, other: &EntityState, pending: &BTreeSet<FieldId>) {
        for (i, slot) in other.fields.iter().enumerate() {
            let id = FieldId::new(u16::try_from(i).unwrap_or(u16::MAX));
            if let Some(value) = slot {
                if !pending.contains(&id) {
                    self.set_value(id, value.clone());
                }
            }
        }
        self.captured_version = other.captured_version.clone();
    }

    /// Returns true if `other` was read at the version this state captured.
    pub(crate) fn same_version(&self, other: &EntityState) -> bool {
        self.captured_version == other.captured_version
    }

    pub(crate) fn remap(&mut self, mapping: &KeyMapping) {
        self.key = mapping.try_remap(&self.key);
        for value in self.fields.iter_mut().flatten() {
            value.map_keys(&mut |key| mapping.get(key).cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RemovalPolicy;

    fn def() -> TypeDef {
        TypeDef::builder(TypeTag::new(1), "Item")
            .scalar("Name")
            .reference("Owner", TypeTag::new(2), RemovalPolicy::Clear)
            .version_field("Version")
            .build()
            .unwrap()
    }

    #[test]
    fn created_state_is_fully_loaded() {
        let key = Key::temporary(TypeTag::new(1), vec![FieldValue::Integer(1)]);
        let state = EntityState::created(&def(), key.clone());
        assert_eq!(state.persistence_state(), PersistenceState::New);
        assert_eq!(state.field(FieldId::new(0)), Some(&FieldValue::Null));
        assert_eq!(state.field(FieldId::new(2)), Some(&FieldValue::Integer(0)));
        assert!(state.captured_version().is_none());
        assert_eq!(state.key(), &key);
    }

    #[test]
    fn transitions() {
        let key = Key::from_id(TypeTag::new(1), 1);
        let mut state = EntityState::synchronized(key, vec![None, None, None], VersionInfo::Void);
        state.mark_modified();
        assert_eq!(state.persistence_state(), PersistenceState::Modified);
        state.mark_removed();
        state.mark_modified();
        assert_eq!(state.persistence_state(), PersistenceState::Removed);
    }

    #[test]
    fn rebase_keeps_pending_fields() {
        let key = Key::from_id(TypeTag::new(1), 1);
        let owner = Key::from_id(TypeTag::new(2), 9);
        let v1 = VersionInfo::from_pairs(vec![(FieldId::new(2), FieldValue::Integer(1))]);
        let v2 = VersionInfo::from_pairs(vec![(FieldId::new(2), FieldValue::Integer(2))]);
        let mut local = EntityState::synchronized(
            key.clone(),
            vec![Some("mine".into()), Some(FieldValue::Null), Some(FieldValue::Integer(2))],
            v1,
        );
        local.mark_modified();
        let store = EntityState::synchronized(
            key,
            vec![Some("theirs".into()), Some(owner.clone().into()), Some(FieldValue::Integer(2))],
            v2.clone(),
        );
        assert!(!local.same_version(&store));

        local.rebase_onto(&store, &BTreeSet::from([FieldId::new(0)]));
        assert_eq!(local.field(FieldId::new(0)), Some(&FieldValue::from("mine")));
        assert_eq!(local.field(FieldId::new(1)), Some(&FieldValue::Ref(owner)));
        assert_eq!(local.captured_version(), Some(&v2));
        assert_eq!(local.persistence_state(), PersistenceState::Modified);
        assert!(local.same_version(&store));
    }

    #[test]
    fn fill_missing_keeps_loaded_values() {
        let key = Key::from_id(TypeTag::new(1), 1);
        let mut cached = EntityState::synchronized(
            key.clone(),
            vec![Some(FieldValue::from("local")), None],
            VersionInfo::Void,
        );
        let fetched = EntityState::synchronized(
            key,
            vec![Some(FieldValue::from("remote")), Some(FieldValue::Null)],
            VersionInfo::Void,
        );
        cached.fill_missing(&fetched);
        assert_eq!(cached.field(FieldId::new(0)), Some(&FieldValue::from("local")));
        assert!(cached.is_available(FieldId::new(1)));

        cached.refresh_from(&fetched);
        assert_eq!(cached.field(FieldId::new(0)), Some(&FieldValue::from("remote")));
    }

    #[test]
    fn references_and_remap() {
        let owner = Key::temporary(TypeTag::new(2), vec![FieldValue::Integer(5)]);
        let mut state = EntityState::created(&def(), Key::from_id(TypeTag::new(1), 1));
        state.set_value(FieldId::new(1), FieldValue::Ref(owner.clone()));
        assert_eq!(state.references(), vec![(FieldId::new(1), &owner)]);
        assert_eq!(state.fields_referencing(&owner), vec![FieldId::new(1)]);

        let mut mapping = KeyMapping::new();
        let permanent = Key::from_id(TypeTag::new(2), 50);
        mapping.insert(owner, permanent.clone()).unwrap();
        state.remap(&mapping);
        assert_eq!(state.field(FieldId::new(1)), Some(&FieldValue::Ref(permanent)));
    }
}
