//! Version-checked, all-or-nothing replay.

use super::state::{SyncState, SyncStats};
use crate::error::{CoreError, CoreResult};
use crate::session::BackingSession;
use crate::version::Conflict;
use dstate_protocol::{Key, KeyMapping, Operation, OperationLog, VersionInfo};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Replays operation logs against a backing session.
///
/// A replay validates the captured base versions first, then applies every
/// operation in log order inside one store transaction. `CreateEntity`
/// operations on temporary keys allocate a permanent key; every later
/// operation is rewritten through the mapping built so far. Any failure
/// rolls the store transaction back and discards the partial mapping.
/// The engine never touches the caller's log.
#[derive(Debug, Default)]
pub struct SyncEngine {
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl SyncEngine {
    /// Creates a new engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Replays a whole log, typically one deserialized from elsewhere.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` if the log has open checkpoints, with
    /// `VersionConflict` if a base version is stale, and with
    /// `ReplayFailed` if the store rejects an operation.
    pub fn replay<S: BackingSession + ?Sized>(
        &self,
        log: &OperationLog,
        session: &mut S,
    ) -> CoreResult<KeyMapping> {
        if log.open_checkpoints() > 0 {
            return Err(CoreError::invalid_state(format!(
                "cannot replay a log with {} open checkpoint(s)",
                log.open_checkpoints()
            )));
        }
        self.replay_operations(log.operations(), log.base_versions(), session)
    }

    /// Replays `operations`, validating the subjects that have a base
    /// version in `base_versions`.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::replay`].
    pub fn replay_operations<S: BackingSession + ?Sized>(
        &self,
        operations: &[Operation],
        base_versions: &BTreeMap<Key, VersionInfo>,
        session: &mut S,
    ) -> CoreResult<KeyMapping> {
        if !self.state().can_start() {
            return Err(CoreError::invalid_state("a replay is already running"));
        }
        if operations.is_empty() {
            return Ok(KeyMapping::new());
        }

        self.set_state(SyncState::Validating);
        if let Err(e) = self.validate(operations, base_versions, session) {
            let rejected = matches!(e, CoreError::VersionConflict { .. });
            self.set_state(if rejected {
                SyncState::Rejected
            } else {
                SyncState::Failed
            });
            let mut stats = self.stats.write();
            if rejected {
                stats.replays_rejected += 1;
            } else {
                stats.replays_failed += 1;
            }
            stats.last_error = Some(e.to_string());
            warn!(error = %e, "replay rejected during validation");
            return Err(e);
        }

        self.set_state(SyncState::Applying);
        match Self::apply(operations, session) {
            Ok(mapping) => {
                self.set_state(SyncState::Committed);
                let mut stats = self.stats.write();
                stats.replays_committed += 1;
                stats.operations_applied += operations.len() as u64;
                stats.keys_remapped += mapping.len() as u64;
                info!(
                    operations = operations.len(),
                    remapped = mapping.len(),
                    "replay committed"
                );
                Ok(mapping)
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                let mut stats = self.stats.write();
                stats.replays_failed += 1;
                stats.last_error = Some(e.to_string());
                warn!(error = %e, "replay failed and was rolled back");
                Err(e)
            }
        }
    }

    /// Compares base versions of the replayed subjects with the store.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` listing every stale or vanished entity.
    pub fn validate<S: BackingSession + ?Sized>(
        &self,
        operations: &[Operation],
        base_versions: &BTreeMap<Key, VersionInfo>,
        session: &mut S,
    ) -> CoreResult<()> {
        let subjects: BTreeSet<&Key> = operations.iter().map(Operation::key).collect();
        let mut conflicts = Vec::new();
        for key in subjects {
            let Some(expected) = base_versions.get(key) else {
                continue;
            };
            let actual = session.current_version_of(key)?;
            if actual.as_ref() != Some(expected) {
                debug!(%key, %expected, "captured version is stale");
                conflicts.push(Conflict {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(CoreError::VersionConflict { conflicts })
        }
    }

    fn apply<S: BackingSession + ?Sized>(
        operations: &[Operation],
        session: &mut S,
    ) -> CoreResult<KeyMapping> {
        session.begin_transaction()?;
        let mut mapping = KeyMapping::new();
        for (index, op) in operations.iter().enumerate() {
            if let Err(e) = Self::apply_one(op, &mut mapping, session) {
                Self::abort(session);
                return Err(CoreError::ReplayFailed {
                    index,
                    message: e.to_string(),
                });
            }
        }
        debug!(operations = operations.len(), "replayed batch");
        if let Err(e) = session.commit() {
            Self::abort(session);
            return Err(CoreError::ReplayFailed {
                index: operations.len(),
                message: e.to_string(),
            });
        }
        Ok(mapping)
    }

    fn apply_one<S: BackingSession + ?Sized>(
        op: &Operation,
        mapping: &mut KeyMapping,
        session: &mut S,
    ) -> CoreResult<()> {
        match op {
            Operation::CreateEntity { key, type_tag } if key.is_temporary() => {
                let permanent = session.allocate_permanent_key(*type_tag)?;
                mapping.insert(key.clone(), permanent.clone())?;
                session.execute_operation(&Operation::CreateEntity {
                    key: permanent,
                    type_tag: *type_tag,
                })
            }
            _ => session.execute_operation(&op.remapped(mapping)),
        }
    }

    fn abort<S: BackingSession + ?Sized>(session: &mut S) {
        if let Err(e) = session.rollback() {
            warn!(error = %e, "store rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RemovalPolicy, Schema, TypeDef};
    use crate::session::MemoryStore;
    use dstate_protocol::{FieldId, FieldValue, TypeTag};
    use std::sync::Arc;

    const ITEM: TypeTag = TypeTag::new(1);
    const LINK: TypeTag = TypeTag::new(2);

    fn store() -> MemoryStore {
        let schema = Schema::new([
            TypeDef::builder(ITEM, "Item")
                .scalar("Value")
                .version_field("Version")
                .build()
                .unwrap(),
            TypeDef::builder(LINK, "Link")
                .reference("Item", ITEM, RemovalPolicy::Deny)
                .build()
                .unwrap(),
        ])
        .unwrap();
        MemoryStore::new(Arc::new(schema))
    }

    fn temp(tag: TypeTag, n: i64) -> Key {
        Key::temporary(tag, vec![FieldValue::Integer(n)])
    }

    #[test]
    fn creates_are_remapped_in_later_operations() {
        let store = store();
        let mut session = store.session();
        let mut log = OperationLog::new();
        log.append(Operation::CreateEntity {
            key: temp(ITEM, 1),
            type_tag: ITEM,
        });
        log.append(Operation::SetField {
            key: temp(ITEM, 1),
            field: FieldId::new(0),
            value: FieldValue::from("v1"),
        });
        log.append(Operation::CreateEntity {
            key: temp(LINK, 2),
            type_tag: LINK,
        });
        log.append(Operation::SetField {
            key: temp(LINK, 2),
            field: FieldId::new(0),
            value: FieldValue::Ref(temp(ITEM, 1)),
        });

        let engine = SyncEngine::new();
        let mapping = engine.replay(&log, &mut session).unwrap();
        let item = mapping.try_remap(&temp(ITEM, 1));
        let link = mapping.try_remap(&temp(LINK, 2));
        assert!(!item.is_temporary());
        assert_eq!(store.field(&item, FieldId::new(0)), Some(FieldValue::from("v1")));
        assert_eq!(store.field(&link, FieldId::new(0)), Some(FieldValue::Ref(item)));
        assert_eq!(engine.state(), SyncState::Committed);
        assert_eq!(engine.stats().keys_remapped, 2);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn stale_base_version_is_rejected_before_applying() {
        let store = store();
        let item = store
            .seed(ITEM, vec![(FieldId::new(0), FieldValue::from("a"))])
            .unwrap();
        let captured = store.version_of(&item).unwrap();
        store
            .external_update(&item, FieldId::new(0), FieldValue::from("b"))
            .unwrap();

        let mut log = OperationLog::new();
        log.record_base_version(item.clone(), captured.clone());
        log.append(Operation::SetField {
            key: item.clone(),
            field: FieldId::new(0),
            value: FieldValue::from("c"),
        });

        let engine = SyncEngine::new();
        let err = engine.replay(&log, &mut store.session()).unwrap_err();
        match err {
            CoreError::VersionConflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].expected, captured);
                assert_eq!(conflicts[0].actual, store.version_of(&item));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(engine.state(), SyncState::Rejected);
        assert_eq!(store.field(&item, FieldId::new(0)), Some(FieldValue::from("b")));
        assert_eq!(store.executed_operations(), 0);
    }

    #[test]
    fn failure_rolls_back_everything() {
        let store = store();
        store.fail_after(2);
        let mut log = OperationLog::new();
        for n in 1..=3 {
            log.append(Operation::CreateEntity {
                key: temp(ITEM, n),
                type_tag: ITEM,
            });
        }

        let engine = SyncEngine::new();
        let err = engine.replay(&log, &mut store.session()).unwrap_err();
        assert!(matches!(err, CoreError::ReplayFailed { index: 2, .. }));
        assert!(store.is_empty());
        assert_eq!(engine.state(), SyncState::Failed);
        assert_eq!(engine.stats().replays_failed, 1);
    }

    #[test]
    fn open_checkpoints_are_rejected() {
        let store = store();
        let mut log = OperationLog::new();
        log.checkpoint();
        let engine = SyncEngine::new();
        assert!(matches!(
            engine.replay(&log, &mut store.session()),
            Err(CoreError::InvalidState { .. })
        ));
    }
}
