//! Suite de contrato compartida por los backends (feature `test-utils`).
//!
//! Cada función recibe un store y un `instance_id` sin eventos previos y
//! verifica una propiedad observable del trait `EventStore`. Los tests de
//! cada backend sólo tienen que invocarlas.

use std::collections::HashMap;

use crate::{Event, EventData, EventStatus, EventStore, EventStoreError};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn create_then_find_by_name_roundtrip<S: EventStore>(store: &mut S, instance_id: &str) {
    let event = Event::triggered(instance_id, "test_event_name", "Internal", "{\"data\":\"event_dat\"}", "state1");
    let created = store.create(instance_id, event.clone()).expect("create");
    assert!(created.id.is_some(), "storage must assign an id");
    assert!(created.created_at.is_some());

    let found = store.find_by_name(instance_id, "test_event_name").expect("find");
    assert_eq!(found.as_ref(), Some(&created));

    let stripped = Event { id: None, created_at: None, updated_at: None, ..created };
    assert_eq!(stripped, event);

    assert_eq!(store.find_by_name(instance_id, "missing").expect("find missing"), None);
}

pub fn bulk_ordered_follows_requested_order<S: EventStore>(store: &mut S, instance_id: &str) {
    let event1 = Event::pending(instance_id, "event1", "someType");
    let event3 = Event::pending(instance_id, "event3", "someType");
    let dto1 = EventData::from(&event1);
    let dto3 = EventData::from(&event3);
    store.create(instance_id, event1).expect("create event1");
    store.create(instance_id, event3).expect("create event3");

    let forward = store.find_bulk_ordered(instance_id, &names(&["event1", "event3"])).expect("bulk");
    assert_eq!(forward, vec![dto1.clone(), dto3.clone()]);

    let reversed = store.find_bulk_ordered(instance_id, &names(&["event3", "event1"])).expect("bulk");
    assert_eq!(reversed, vec![dto3.clone(), dto1.clone()]);

    // nombres inexistentes no producen salida; duplicados colapsan
    let mixed = store.find_bulk_ordered(instance_id, &names(&["ghost", "event3", "event1", "event3"]))
                     .expect("bulk");
    assert_eq!(mixed, vec![dto3, dto1]);

    assert!(store.find_bulk_ordered(instance_id, &[]).expect("empty").is_empty());
}

pub fn duplicate_create_rejected<S: EventStore>(store: &mut S, instance_id: &str) {
    store.create(instance_id, Event::pending(instance_id, "dup", "t")).expect("first create");
    let err = store.create(instance_id, Event::triggered(instance_id, "dup", "t", "other", "s"))
                   .expect_err("second create must fail");
    assert_eq!(err,
               EventStoreError::DuplicateEvent { instance_id: instance_id.to_string(), name: "dup".into() });
    // la fila original no fue sobrescrita
    let stored = store.find_by_name(instance_id, "dup").expect("find").expect("present");
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.event_data, None);
}

pub fn cancel_is_idempotent_and_wins<S: EventStore>(store: &mut S, instance_id: &str) {
    store.create(instance_id, Event::pending(instance_id, "x", "t")).expect("create x");
    store.cancel(instance_id, "x").expect("first cancel");
    store.cancel(instance_id, "x").expect("second cancel");
    let x = store.find_by_name(instance_id, "x").expect("find").expect("present");
    assert_eq!(x.status, EventStatus::Cancelled);

    store.create(instance_id, Event::triggered(instance_id, "y", "t", "data", "src")).expect("create y");
    store.cancel(instance_id, "y").expect("cancel triggered");
    let y = store.find_by_name(instance_id, "y").expect("find").expect("present");
    assert_eq!(y.status, EventStatus::Cancelled);
    assert_eq!(y.event_data.as_deref(), Some("data"));

    // cero filas coincidentes no es error
    store.cancel(instance_id, "never_declared").expect("cancel unknown");
    assert_eq!(store.find_by_name(instance_id, "never_declared").expect("find"), None);
}

pub fn status_filters_exclude_pending<S: EventStore>(store: &mut S, instance_id: &str) {
    store.create(instance_id, Event::pending(instance_id, "p", "t")).expect("create p");
    store.create(instance_id, Event::triggered(instance_id, "t", "t", "d", "s")).expect("create t");
    store.create(instance_id, Event::pending(instance_id, "c", "t")).expect("create c");
    store.cancel(instance_id, "c").expect("cancel c");

    let mut resolved = store.find_names_by_status(instance_id, &EventStatus::RESOLVED).expect("names");
    resolved.sort();
    assert_eq!(resolved, names(&["c", "t"]));

    let mut default_set = store.find_resolved_names(instance_id).expect("resolved");
    default_set.sort();
    assert_eq!(default_set, resolved);

    let pending = store.find_names_by_status(instance_id, &[EventStatus::Pending]).expect("pending");
    assert_eq!(pending, names(&["p"]));

    let mut with_status = store.find_status_by_status(instance_id, &EventStatus::RESOLVED).expect("projection");
    with_status.sort();
    assert_eq!(with_status,
               vec![("c".to_string(), EventStatus::Cancelled), ("t".to_string(), EventStatus::Triggered)]);

    let triggered = store.find_triggered(instance_id).expect("triggered");
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].name, "t");

    assert_eq!(store.find_all_for_instance(instance_id).expect("all").len(), 3);

    let snapshot = store.status_snapshot(instance_id, false).expect("snapshot");
    let expected: HashMap<String, EventStatus> = [("p".to_string(), EventStatus::Pending),
                                                  ("t".to_string(), EventStatus::Triggered),
                                                  ("c".to_string(), EventStatus::Cancelled)].into_iter()
                                                                                           .collect();
    assert_eq!(snapshot, expected);
    assert_eq!(store.status_snapshot(instance_id, true).expect("locked snapshot"), expected);
}

pub fn update_persists_transition<S: EventStore>(store: &mut S, instance_id: &str) {
    let mut ev = store.create(instance_id, Event::pending(instance_id, "order_paid", "payment").with_originating_state("await_payment"))
                      .expect("create");
    ev.trigger("{\"amount\":42}", "payment_service").expect("pending -> triggered");
    store.update_status_and_data(instance_id, &ev).expect("update");

    let stored = store.find_by_name(instance_id, "order_paid").expect("find").expect("present");
    assert_eq!(stored.status, EventStatus::Triggered);
    assert_eq!(stored.event_data.as_deref(), Some("{\"amount\":42}"));
    assert_eq!(stored.event_source.as_deref(), Some("payment_service"));
    assert_eq!(stored.originating_state.as_deref(), Some("await_payment"));
    assert_eq!(store.find_bulk_ordered(instance_id, &names(&["order_paid"])).expect("bulk"),
               vec![EventData { name: "order_paid".into(),
                                event_type: "payment".into(),
                                data: Some("{\"amount\":42}".into()),
                                source: Some("payment_service".into()) }]);
}

pub fn update_rejects_invalid_requests<S: EventStore>(store: &mut S, instance_id: &str) {
    let unsaved = Event::pending(instance_id, "ghost", "t");
    assert_eq!(store.update_status_and_data(instance_id, &unsaved),
               Err(EventStoreError::MissingIdentity { name: "ghost".into() }));

    let mut phantom = Event::pending(instance_id, "ghost", "t");
    phantom.id = Some(i64::MAX);
    assert_eq!(store.update_status_and_data(instance_id, &phantom),
               Err(EventStoreError::EventNotFound { instance_id: instance_id.to_string(), id: i64::MAX }));

    let created = store.create(instance_id, Event::pending(instance_id, "gone", "t")).expect("create");
    store.cancel(instance_id, "gone").expect("cancel");
    let mut revive = created.clone();
    revive.status = EventStatus::Triggered;
    revive.event_data = Some("late".into());
    let err = store.update_status_and_data(instance_id, &revive).expect_err("cancelled is terminal");
    assert_eq!(err,
               EventStoreError::InvalidTransition { name: "gone".into(),
                                                    from: EventStatus::Cancelled,
                                                    to: EventStatus::Triggered });
    let stored = store.find_by_name(instance_id, "gone").expect("find").expect("present");
    assert_eq!(stored.status, EventStatus::Cancelled);
    assert_eq!(stored.event_data, None);
}

pub fn quoted_names_are_plain_data<S: EventStore>(store: &mut S, instance_id: &str) {
    let tricky = "it's') or ('1'='1";
    store.create(instance_id, Event::pending(instance_id, tricky, "t")).expect("create tricky");
    store.create(instance_id, Event::pending(instance_id, "plain", "t")).expect("create plain");
    let out = store.find_bulk_ordered(instance_id, &names(&[tricky])).expect("bulk");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, tricky);
    store.cancel(instance_id, tricky).expect("cancel tricky");
    assert_eq!(store.find_resolved_names(instance_id).expect("resolved"), names(&[tricky]));
}

/// Un `DuplicateEvent` capturado por el llamador no invalida el handle: las
/// escrituras previas y posteriores siguen en pie.
pub fn caught_duplicate_keeps_handle_usable<S: EventStore>(store: &mut S, instance_id: &str) {
    store.create(instance_id, Event::pending(instance_id, "a", "t")).expect("create a");
    let err = store.create(instance_id, Event::pending(instance_id, "a", "t")).expect_err("duplicate a");
    assert!(matches!(err, EventStoreError::DuplicateEvent { .. }), "got {err:?}");

    store.create(instance_id, Event::pending(instance_id, "b", "t")).expect("create b after duplicate");
    let mut a = store.find_by_name(instance_id, "a").expect("find a").expect("a present");
    a.trigger("payload", "producer").expect("pending -> triggered");
    store.update_status_and_data(instance_id, &a).expect("update a after duplicate");
    store.cancel(instance_id, "b").expect("cancel b");

    let mut all: Vec<(String, EventStatus)> = store.find_all_for_instance(instance_id)
                                                   .expect("all")
                                                   .into_iter()
                                                   .map(|e| (e.name, e.status))
                                                   .collect();
    all.sort();
    assert_eq!(all,
               vec![("a".to_string(), EventStatus::Triggered), ("b".to_string(), EventStatus::Cancelled)]);
}

/// Ejecuta la suite completa; `fresh_instance` debe devolver un id sin eventos.
pub fn run_all<S: EventStore>(store: &mut S, mut fresh_instance: impl FnMut() -> String) {
    create_then_find_by_name_roundtrip(store, &fresh_instance());
    bulk_ordered_follows_requested_order(store, &fresh_instance());
    duplicate_create_rejected(store, &fresh_instance());
    cancel_is_idempotent_and_wins(store, &fresh_instance());
    status_filters_exclude_pending(store, &fresh_instance());
    update_persists_transition(store, &fresh_instance());
    update_rejects_invalid_requests(store, &fresh_instance());
    quoted_names_are_plain_data(store, &fresh_instance());
    caught_duplicate_keeps_handle_usable(store, &fresh_instance());
}
