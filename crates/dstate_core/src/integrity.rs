//! Referential integrity checks for removals.

use crate::config::Config;
use crate::entity::{EntityCache, EntityState};
use crate::error::{CoreError, CoreResult};
use crate::schema::{FieldKind, RemovalPolicy, Schema};
use crate::session::{BackingSession, Query};
use dstate_protocol::{FieldId, FieldValue, Key, Operation};
use std::collections::{BTreeMap, BTreeSet};

/// Side effects of removing one entity, computed without mutating anything.
#[derive(Debug, Default)]
pub struct RemovalPlan {
    /// Operations to apply, in order. Detaching operations precede the
    /// `RemoveEntity` of the entity they detach from.
    pub operations: Vec<Operation>,
    /// Every entity the plan removes, the requested one last.
    pub removed: Vec<Key>,
    /// Referencing entities fetched from the store that are not cached yet.
    pub fetched: Vec<EntityState>,
}

/// Plans removals against the cached graph and, when connected, the store.
///
/// For each association pointing at the removed entity:
/// - `Deny` rejects the whole removal
/// - `Clear` emits a `SetField` to null or a `CollectionRemove`
/// - `Cascade` plans the referencing entity's removal first
pub struct RemovalPlanner<'a, 's> {
    schema: &'a Schema,
    cache: &'a EntityCache,
    config: &'a Config,
    session: Option<&'a mut (dyn BackingSession + 's)>,
    visited: BTreeSet<Key>,
    fetched: BTreeMap<Key, EntityState>,
    plan: RemovalPlan,
}

impl<'a, 's> RemovalPlanner<'a, 's> {
    /// Creates a planner. Pass a session to also consult the store.
    pub fn new(
        schema: &'a Schema,
        cache: &'a EntityCache,
        config: &'a Config,
        session: Option<&'a mut (dyn BackingSession + 's)>,
    ) -> Self {
        let session = session.filter(|_| config.fetch_references_on_remove);
        Self {
            schema,
            cache,
            config,
            session,
            visited: BTreeSet::new(),
            fetched: BTreeMap::new(),
            plan: RemovalPlan::default(),
        }
    }

    /// Plans the removal of `key`.
    ///
    /// # Errors
    ///
    /// Returns a referential integrity error if a `Deny` association still
    /// points at the entity or at anything it cascades to, and an invalid
    /// state error if the cascade is deeper than the configured limit.
    pub fn plan(mut self, key: &Key) -> CoreResult<RemovalPlan> {
        self.visit(key, 0)?;
        self.plan.fetched = self.fetched.into_values().collect();
        Ok(self.plan)
    }

    fn visit(&mut self, key: &Key, depth: usize) -> CoreResult<()> {
        if depth > self.config.max_cascade_depth {
            return Err(CoreError::invalid_state(format!(
                "cascading removal of {key} exceeds depth {}",
                self.config.max_cascade_depth
            )));
        }
        if !self.visited.insert(key.clone()) {
            return Ok(());
        }

        for (referencer, field) in self.referencers(key)? {
            if self.visited.contains(&referencer) {
                continue;
            }
            let def = self.schema.field(referencer.type_tag(), field)?;
            let Some((_, policy)) = def.kind.association() else {
                continue;
            };
            match policy {
                RemovalPolicy::Deny => {
                    return Err(CoreError::ReferentialIntegrity {
                        key: key.clone(),
                        referenced_by: referencer,
                        field,
                    });
                }
                RemovalPolicy::Clear => {
                    let op = match def.kind {
                        FieldKind::Collection { .. } => Operation::CollectionRemove {
                            key: referencer,
                            field,
                            item: key.clone(),
                        },
                        _ => Operation::SetField {
                            key: referencer,
                            field,
                            value: FieldValue::Null,
                        },
                    };
                    self.plan.operations.push(op);
                }
                RemovalPolicy::Cascade => self.visit(&referencer, depth + 1)?,
            }
        }

        self.plan
            .operations
            .push(Operation::RemoveEntity { key: key.clone() });
        self.plan.removed.push(key.clone());
        Ok(())
    }

    /// Collects (referencer, field) pairs from the cache, then from the
    /// store for entities the cache does not hold.
    fn referencers(&mut self, target: &Key) -> CoreResult<Vec<(Key, FieldId)>> {
        let mut found: BTreeSet<(Key, FieldId)> = self.cache.referencers(target).into_iter().collect();
        for state in self.fetched.values() {
            for field in state.fields_referencing(target) {
                found.insert((state.key().clone(), field));
            }
        }

        if target.is_temporary() {
            return Ok(found.into_iter().collect());
        }
        let Some(session) = self.session.as_deref_mut() else {
            return Ok(found.into_iter().collect());
        };
        for (def, field) in self.schema.associations_to(target.type_tag()) {
            let query = Query::Referencing {
                type_tag: def.tag(),
                field: field.id,
                target: target.clone(),
            };
            for state in session.fetch_by_query(&query)? {
                if self.cache.contains(state.key()) || self.fetched.contains_key(state.key()) {
                    continue;
                }
                found.insert((state.key().clone(), field.id));
                self.fetched.insert(state.key().clone(), state);
            }
        }
        Ok(found.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeDef;
    use dstate_protocol::{TypeTag, VersionInfo};

    const OWNER: TypeTag = TypeTag::new(1);
    const PART: TypeTag = TypeTag::new(2);
    const TAG: TypeTag = TypeTag::new(3);
    const LOCK: TypeTag = TypeTag::new(4);

    fn schema() -> Schema {
        Schema::new([
            TypeDef::builder(OWNER, "Owner")
                .collection("Tags", TAG, RemovalPolicy::Clear)
                .build()
                .unwrap(),
            TypeDef::builder(PART, "Part")
                .reference("Owner", OWNER, RemovalPolicy::Cascade)
                .build()
                .unwrap(),
            TypeDef::builder(TAG, "Tag")
                .reference("Part", PART, RemovalPolicy::Clear)
                .build()
                .unwrap(),
            TypeDef::builder(LOCK, "Lock")
                .reference("Part", PART, RemovalPolicy::Deny)
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    fn state(key: Key, fields: Vec<FieldValue>) -> EntityState {
        EntityState::synchronized(key, fields.into_iter().map(Some).collect(), VersionInfo::Void)
    }

    fn k(tag: TypeTag, id: i64) -> Key {
        Key::from_id(tag, id)
    }

    fn cache() -> EntityCache {
        let mut cache = EntityCache::new();
        cache.insert(state(k(OWNER, 1), vec![FieldValue::Keys(vec![k(TAG, 1)])]));
        cache.insert(state(k(PART, 1), vec![FieldValue::Ref(k(OWNER, 1))]));
        cache.insert(state(k(TAG, 1), vec![FieldValue::Ref(k(PART, 1))]));
        cache
    }

    #[test]
    fn cascade_and_clear_are_ordered_before_removal() {
        let schema = schema();
        let cache = cache();
        let config = Config::default();
        let plan = RemovalPlanner::new(&schema, &cache, &config, None)
            .plan(&k(OWNER, 1))
            .unwrap();

        assert_eq!(
            plan.operations,
            vec![
                Operation::SetField {
                    key: k(TAG, 1),
                    field: FieldId::new(0),
                    value: FieldValue::Null,
                },
                Operation::RemoveEntity { key: k(PART, 1) },
                Operation::RemoveEntity { key: k(OWNER, 1) },
            ]
        );
        assert_eq!(plan.removed, vec![k(PART, 1), k(OWNER, 1)]);
    }

    #[test]
    fn clear_on_collection_emits_collection_remove() {
        let schema = schema();
        let cache = cache();
        let config = Config::default();
        let plan = RemovalPlanner::new(&schema, &cache, &config, None)
            .plan(&k(TAG, 1))
            .unwrap();
        assert_eq!(
            plan.operations[0],
            Operation::CollectionRemove {
                key: k(OWNER, 1),
                field: FieldId::new(0),
                item: k(TAG, 1),
            }
        );
    }

    #[test]
    fn deny_anywhere_in_the_cascade_rejects() {
        let schema = schema();
        let mut cache = cache();
        cache.insert(state(k(LOCK, 1), vec![FieldValue::Ref(k(PART, 1))]));
        let config = Config::default();
        let err = RemovalPlanner::new(&schema, &cache, &config, None)
            .plan(&k(OWNER, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ReferentialIntegrity { ref key, ref referenced_by, .. }
                if *key == k(PART, 1) && *referenced_by == k(LOCK, 1)
        ));
    }

    #[test]
    fn depth_limit() {
        let schema = schema();
        let cache = cache();
        let config = Config::default().max_cascade_depth(0);
        let err = RemovalPlanner::new(&schema, &cache, &config, None)
            .plan(&k(OWNER, 1))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }
}
