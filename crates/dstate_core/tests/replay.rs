//! Serialized logs, standalone replay, and failure handling.

use dstate_core::{CoreError, PersistenceState, SyncEngine, SyncState};
use dstate_protocol::{FieldValue, OperationLog};
use dstate_testkit::prelude::*;
use proptest::prelude::*;

fn same_rows(left: &Catalog, right: &Catalog) -> bool {
    ALL_TYPES.iter().all(|tag| {
        let keys = left.store.keys_of_type(*tag);
        keys == right.store.keys_of_type(*tag)
            && keys.iter().all(|k| left.store.row(k) == right.store.row(k))
    })
}

#[test]
fn exported_log_replays_in_another_store() {
    let here = Catalog::seeded();
    let there = Catalog::seeded();
    let mut state = here.state();
    let mut session = here.store.session();
    here.prefetch_all(&mut state, &mut session);

    let gizmo = here.keys.products[2].clone();
    let order = here.keys.orders[1].clone();
    state.set_field(&gizmo, product::PRICE, 80).unwrap();
    state
        .create_with(
            ORDER_LINE,
            vec![
                (order_line::ORDER, order.clone().into()),
                (order_line::PRODUCT, gizmo.clone().into()),
                (order_line::QUANTITY, 3.into()),
            ],
        )
        .unwrap();

    let bytes = state.export_log().unwrap();
    let log = OperationLog::deserialize(&bytes).unwrap();
    assert_eq!(log.cycle_id(), state.cycle_id());
    assert_eq!(log.operations(), state.operation_log().operations());
    assert_eq!(log.base_versions(), state.operation_log().base_versions());

    let engine = SyncEngine::new();
    let remote = engine.replay(&log, &mut there.store.session()).unwrap();
    let local = state.attach(&mut session).unwrap().save_changes().unwrap();
    assert_eq!(remote, local);
    assert!(same_rows(&here, &there));
    assert_eq!(engine.stats().replays_committed, 1);
}

#[test]
fn export_inside_a_scope_is_refused() {
    let catalog = Catalog::empty();
    let mut state = catalog.state();
    state.create(NOTE).unwrap();
    let scope = state.transaction();
    assert!(matches!(
        scope.export_log(),
        Err(CoreError::Protocol(_))
    ));
}

#[test]
fn failed_replay_leaves_cache_log_and_store_untouched() {
    let catalog = Catalog::seeded();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);
    let widget = catalog.keys.products[0].clone();

    state.set_field(&widget, product::NAME, "Widget II").unwrap();
    let note = state
        .create_with(NOTE, vec![(note::TEXT, "check stock".into())])
        .unwrap();
    let operations = state.operation_log().operations().to_vec();
    let widget_before = state.entity(&widget).unwrap().clone();

    catalog.store.fail_after(2);
    let mut attached = state.attach(&mut session).unwrap();
    let err = attached.save_changes().unwrap_err();
    assert!(matches!(err, CoreError::ReplayFailed { index: 2, .. }));
    assert!(err.is_retryable());
    assert_eq!(attached.sync_state(), SyncState::Failed);
    assert_eq!(attached.operation_log().operations(), operations.as_slice());
    assert_eq!(attached.entity(&widget).unwrap(), &widget_before);
    assert_eq!(attached.get_persistence_state(&note), Some(PersistenceState::New));
    assert_eq!(
        catalog.store.field(&widget, product::NAME),
        Some(FieldValue::from("Widget"))
    );
    assert!(catalog.store.keys_of_type(NOTE).is_empty());

    // The whole log is retried on the next save.
    let mapping = attached.save_changes().unwrap();
    assert_eq!(
        catalog.store.field(&widget, product::NAME),
        Some(FieldValue::from("Widget II"))
    );
    assert!(catalog.store.contains(&mapping.try_remap(&note)));
    assert_eq!(attached.sync_stats().replays_failed, 1);
    assert_eq!(attached.sync_stats().replays_committed, 1);
}

#[test]
fn vanished_entity_is_a_conflict() {
    let catalog = Catalog::seeded();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);
    let gadget = catalog.keys.products[1].clone();

    state.set_field(&gadget, product::PRICE, 1).unwrap();
    catalog.store.external_remove(&gadget).unwrap();
    let err = state.attach(&mut session).unwrap().save_changes().unwrap_err();
    match err {
        CoreError::VersionConflict { conflicts } => {
            assert_eq!(conflicts[0].key, gadget);
            assert_eq!(conflicts[0].actual, None);
        }
        other => panic!("expected a version conflict, got {other}"),
    }
}

#[test]
fn stale_temporary_keys_resolve_after_save() {
    let catalog = Catalog::empty();
    let mut state = catalog.state();
    let acme = state
        .create_with(SUPPLIER, vec![(supplier::NAME, "Acme".into())])
        .unwrap();
    let mut session = catalog.store.session();
    let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
    let acme_p = mapping.try_remap(&acme);

    assert_eq!(state.resolve(&acme), acme_p);
    assert_eq!(state.entity(&acme).unwrap().key(), &acme_p);
    assert_eq!(state.all(SUPPLIER), vec![acme_p.clone()]);
    assert_eq!(state.key_history().get(&acme), Some(&acme_p));

    // New values naming the old key are rewritten too.
    let widget = state
        .create_with(
            PRODUCT,
            vec![
                (product::NAME, "Widget".into()),
                (product::SUPPLIER, acme.clone().into()),
            ],
        )
        .unwrap();
    assert_eq!(
        state.field(&widget, product::SUPPLIER).unwrap(),
        &FieldValue::Ref(acme_p)
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn deserialized_replay_matches_direct_save(script in catalog_script_strategy(16)) {
        let here = Catalog::seeded();
        let there = Catalog::seeded();
        let mut state = here.state();
        let mut session = here.store.session();
        here.prefetch_all(&mut state, &mut session);
        let mut keys = here.keys.clone();
        for edit in &script {
            edit.apply(&mut state, &mut keys).unwrap();
        }

        let log = OperationLog::deserialize(&state.export_log().unwrap()).unwrap();
        SyncEngine::new().replay(&log, &mut there.store.session()).unwrap();
        state.attach(&mut session).unwrap().save_changes().unwrap();
        prop_assert!(same_rows(&here, &there));
    }
}
