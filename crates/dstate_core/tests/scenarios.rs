//! End-to-end disconnected cycles against the catalog store.

use dstate_core::{CoreError, PersistenceState, SyncState};
use dstate_protocol::{FieldValue, Key};
use dstate_testkit::prelude::*;

#[test]
fn created_entity_is_saved_under_a_permanent_key() {
    let catalog = Catalog::empty();
    let mut state = catalog.state();
    let temp = state
        .create_with(SUPPLIER, vec![(supplier::NAME, "v1".into())])
        .unwrap();
    assert!(temp.is_temporary());
    assert_eq!(state.get_persistence_state(&temp), Some(PersistenceState::New));

    let mut session = catalog.store.session();
    let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
    assert_eq!(mapping.len(), 1);
    let permanent = mapping.get(&temp).cloned().unwrap();
    assert!(!permanent.is_temporary());

    let mut fresh = catalog.state();
    let mut attached = fresh.attach(&mut session).unwrap();
    let mut connected = attached.connect();
    let fetched = connected.get(&permanent).unwrap();
    assert_eq!(fetched.field(supplier::NAME), Some(&FieldValue::from("v1")));
    assert_eq!(fetched.persistence_state(), PersistenceState::Synchronized);
}

#[test]
fn stale_capture_is_rejected_and_local_state_kept() {
    let catalog = Catalog::seeded();
    let widget = catalog.keys.products[0].clone();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);
    let captured = state.versions()[&widget].clone();

    state.set_field(&widget, product::PRICE, 300).unwrap();
    catalog
        .store
        .external_update(&widget, product::NAME, "Widget Pro".into())
        .unwrap();
    assert_ne!(catalog.store.version_of(&widget).as_ref(), Some(&captured));

    let log_len = state.operation_log().len();
    let before = state.entity(&widget).unwrap().clone();
    let err = state.attach(&mut session).unwrap().save_changes().unwrap_err();

    match &err {
        CoreError::VersionConflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].key, widget);
            assert_eq!(conflicts[0].expected, captured);
        }
        other => panic!("expected a version conflict, got {other}"),
    }
    assert!(err.is_retryable());
    assert_eq!(state.sync_state(), SyncState::Rejected);
    assert_eq!(state.operation_log().len(), log_len);
    assert_eq!(state.entity(&widget).unwrap(), &before);
    assert_eq!(
        catalog.store.field(&widget, product::PRICE),
        Some(FieldValue::Integer(250))
    );
}

#[test]
fn second_cycle_rewires_and_removes_remapped_entities() {
    let catalog = Catalog::seeded();
    let acme = catalog.keys.suppliers[0].clone();
    let gadget = catalog.keys.products[1].clone();
    let mut session = catalog.store.session();

    // Cycle 1: two new products from Acme.
    let mut state = catalog.state();
    catalog.prefetch_all(&mut state, &mut session);
    let new_product = |state: &mut dstate_core::DisconnectedState, name: &str| -> Key {
        state
            .create_with(
                PRODUCT,
                vec![
                    (product::NAME, name.into()),
                    (product::SUPPLIER, acme.clone().into()),
                ],
            )
            .unwrap()
    };
    let first = new_product(&mut state, "NewProduct1");
    let second = new_product(&mut state, "NewProduct2");
    let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
    assert_eq!(mapping.len(), 2);
    let first_p = mapping.try_remap(&first);
    let second_p = mapping.try_remap(&second);
    assert_eq!(catalog.follow(&first_p, product::SUPPLIER), Some(acme.clone()));

    // Cycle 2, offline, addressing the products through their old keys.
    state.set_field(&second, product::SUPPLIER, FieldValue::Null).unwrap();
    state.remove(&second).unwrap();
    let new_supplier = state
        .create_with(SUPPLIER, vec![(supplier::NAME, "NewSupplier".into())])
        .unwrap();
    state
        .set_field(&first, product::SUPPLIER, new_supplier.clone())
        .unwrap();
    assert_eq!(
        state.get_persistence_state(&second_p),
        Some(PersistenceState::Removed)
    );

    let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
    let new_supplier_p = mapping.try_remap(&new_supplier);

    let supplier_of_first = catalog.follow(&first_p, product::SUPPLIER).unwrap();
    assert_eq!(supplier_of_first, new_supplier_p);
    assert_eq!(
        catalog.text(&supplier_of_first, supplier::NAME).as_deref(),
        Some("NewSupplier")
    );
    assert!(!catalog.store.contains(&second_p));
    let gadget_supplier = catalog.follow(&gadget, product::SUPPLIER).unwrap();
    assert_eq!(catalog.text(&gadget_supplier, supplier::NAME).as_deref(), Some("Acme"));

    assert_eq!(state.get_persistence_state(&second), None);
    assert_eq!(
        state.get_persistence_state(&first),
        Some(PersistenceState::Synchronized)
    );
    assert!(state.operation_log().is_empty());
}

#[test]
fn save_with_nothing_pending_is_a_no_op() {
    let catalog = Catalog::seeded();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);
    let cycle = state.cycle_id();

    let mapping = state.attach(&mut session).unwrap().save_changes().unwrap();
    assert!(mapping.is_empty());
    assert_ne!(state.cycle_id(), cycle);
    assert_eq!(catalog.store.executed_operations(), 0);
}

#[test]
fn refreshing_a_conflicted_entity_lets_the_save_retry() {
    let catalog = Catalog::seeded();
    let widget = catalog.keys.products[0].clone();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);

    state.set_field(&widget, product::PRICE, 300).unwrap();
    catalog
        .store
        .external_update(&widget, product::NAME, "Widget Pro".into())
        .unwrap();
    let mut attached = state.attach(&mut session).unwrap();
    let err = attached.save_changes().unwrap_err();
    assert!(matches!(err, CoreError::VersionConflict { .. }));

    // A plain prefetch leaves the pending changes on the old version.
    attached.connect().prefetch_keys(&[widget.clone()]).unwrap();
    assert!(matches!(
        attached.save_changes(),
        Err(CoreError::VersionConflict { .. })
    ));

    let refreshed = attached.connect().refresh(&[widget.clone()]).unwrap();
    assert_eq!(refreshed, vec![widget.clone()]);
    let store_version = catalog.store.version_of(&widget).unwrap();
    assert_eq!(
        attached.operation_log().base_version(&widget),
        Some(&store_version)
    );
    assert_eq!(attached.versions()[&widget], store_version);
    assert_eq!(
        attached.field(&widget, product::NAME).unwrap(),
        &FieldValue::from("Widget Pro")
    );
    assert_eq!(
        attached.field(&widget, product::PRICE).unwrap(),
        &FieldValue::Integer(300)
    );
    assert_eq!(
        attached.get_persistence_state(&widget),
        Some(PersistenceState::Modified)
    );

    attached.save_changes().unwrap();
    assert_eq!(attached.sync_state(), SyncState::Committed);
    assert_eq!(
        catalog.store.field(&widget, product::PRICE),
        Some(FieldValue::Integer(300))
    );
    assert_eq!(
        catalog.text(&widget, product::NAME).as_deref(),
        Some("Widget Pro")
    );
    assert_ne!(catalog.store.version_of(&widget), Some(store_version));
}

#[test]
fn rolled_back_scope_leaves_no_stale_base_version() {
    let catalog = Catalog::seeded();
    let widget = catalog.keys.products[0].clone();
    let mut state = catalog.state();
    let mut session = catalog.store.session();
    catalog.prefetch_all(&mut state, &mut session);

    {
        let mut scope = state.transaction();
        scope.set_field(&widget, product::PRICE, 1).unwrap();
    }
    assert!(state.operation_log().is_empty());
    assert!(state.operation_log().base_versions().is_empty());

    catalog
        .store
        .external_update(&widget, product::NAME, "Widget Pro".into())
        .unwrap();
    let mut attached = state.attach(&mut session).unwrap();
    attached.connect().prefetch_keys(&[widget.clone()]).unwrap();
    assert_eq!(
        attached.versions().get(&widget),
        catalog.store.version_of(&widget).as_ref()
    );

    attached.set_field(&widget, product::PRICE, 300).unwrap();
    attached.save_changes().unwrap();
    assert_eq!(
        catalog.store.field(&widget, product::PRICE),
        Some(FieldValue::Integer(300))
    );
    assert_eq!(
        catalog.text(&widget, product::NAME).as_deref(),
        Some("Widget Pro")
    );
}
