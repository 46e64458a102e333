//! Version tracking and version root propagation.

use crate::entity::{EntityCache, EntityState};
use crate::schema::Schema;
use dstate_protocol::{FieldValue, Key, Operation, VersionInfo};
use std::collections::{BTreeMap, BTreeSet};

/// A captured version that no longer matches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The conflicting entity.
    pub key: Key,
    /// Version captured when the entity was fetched.
    pub expected: VersionInfo,
    /// Version the store reports, `None` if the entity is gone.
    pub actual: Option<VersionInfo>,
}

/// Computes version stamps and tracks the version root relation.
///
/// The tracker keeps a multimap from each dependent entity to the roots
/// its version root fields currently name. A mutating call bumps the
/// version counter of every touched entity and every transitive root of
/// one, once per call.
#[derive(Debug, Default)]
pub struct VersionTracker {
    roots: BTreeMap<Key, BTreeSet<Key>>,
}

impl VersionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the current version stamp of a cached entity.
    pub fn version_of(schema: &Schema, state: &EntityState) -> VersionInfo {
        schema
            .get(state.type_tag())
            .map_or(VersionInfo::Void, |def| def.version_info(|id| state.field(id)))
    }

    /// Updates the root relation from the state's version root fields.
    pub fn index(&mut self, schema: &Schema, state: &EntityState) {
        let roots: BTreeSet<Key> = schema
            .get(state.type_tag())
            .map(|def| {
                def.version_roots()
                    .iter()
                    .filter_map(|id| state.field(*id).and_then(FieldValue::as_key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if roots.is_empty() {
            self.roots.remove(state.key());
        } else {
            self.roots.insert(state.key().clone(), roots);
        }
    }

    /// Forgets the roots of `key`.
    pub fn unindex(&mut self, key: &Key) {
        self.roots.remove(key);
    }

    /// Rebuilds the root relation from scratch.
    pub fn rebuild(&mut self, schema: &Schema, cache: &EntityCache) {
        self.roots.clear();
        for state in cache.iter() {
            self.index(schema, state);
        }
    }

    /// Returns every root reachable from `key` through chained roots.
    pub fn transitive_roots(&self, key: &Key) -> BTreeSet<Key> {
        let mut found = BTreeSet::new();
        let mut pending = vec![key.clone()];
        while let Some(next) = pending.pop() {
            for root in self.roots.get(&next).into_iter().flatten() {
                if root != key && found.insert(root.clone()) {
                    pending.push(root.clone());
                }
            }
        }
        found
    }

    /// Builds one version counter bump for every live, versionable entity
    /// in `keys`. Keys that are not cached are skipped; callers load
    /// version roots first.
    pub fn bump_operations(
        schema: &Schema,
        cache: &EntityCache,
        keys: &BTreeSet<Key>,
    ) -> Vec<Operation> {
        keys.iter()
            .filter_map(|key| cache.get(key))
            .filter(|state| !state.is_removed())
            .filter_map(|state| {
                let field = schema.get(state.type_tag())?.version_field()?;
                let current = state.field(field).and_then(FieldValue::as_integer).unwrap_or(0);
                Some(Operation::SetField {
                    key: state.key().clone(),
                    field,
                    value: FieldValue::Integer(current + 1),
                })
            })
            .collect()
    }
}
