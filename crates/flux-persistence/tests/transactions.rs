use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use flux_core::{Event, EventStatus, EventStore, EventStoreError};
mod test_support;
use test_support::with_store;
use uuid::Uuid;

#[test]
fn failed_transaction_rolls_back_every_write() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return;
    }
    with_store(|store| {
        let instance = Uuid::new_v4().to_string();
        let mut direct = store.clone();
        let declared = direct.create(&instance, Event::pending(&instance, "a", "t")).expect("seed");

        let res: Result<(), EventStoreError> = store.transaction(&instance, |tx| {
                                                       tx.create(&instance, Event::pending(&instance, "b", "t"))?;
                                                       let mut a = declared.clone();
                                                       a.trigger("payload", "producer")?;
                                                       tx.update_status_and_data(&instance, &a)?;
                                                       tx.create(&instance, Event::pending(&instance, "b", "t"))?;
                                                       Ok(())
                                                   });
        assert!(matches!(res, Err(EventStoreError::DuplicateEvent { .. })), "got {res:?}");

        let all = direct.find_all_for_instance(&instance).expect("all");
        assert_eq!(all, vec![declared]);
    }).expect("test store");
}

// Dos workers: el segundo `FOR UPDATE` espera al commit del primero y ve su escritura.
#[test]
fn locked_snapshots_serialize_across_transactions() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return;
    }
    with_store(|store| {
        let instance = Uuid::new_v4().to_string();
        let mut direct = store.clone();
        direct.create(&instance, Event::pending(&instance, "approval", "human")).expect("seed");

        let (locked_tx, locked_rx) = mpsc::channel();
        let first = {
            let store = store.clone();
            let instance = instance.clone();
            thread::spawn(move || {
                store.transaction(&instance, |tx| {
                         let snap = tx.status_snapshot(&instance, true)?;
                         assert_eq!(snap["approval"], EventStatus::Pending);
                         locked_tx.send(()).expect("signal");
                         thread::sleep(Duration::from_millis(300));
                         let mut ev = tx.find_by_name(&instance, "approval")?.expect("declared");
                         ev.trigger("approved", "reviewer")?;
                         tx.update_status_and_data(&instance, &ev)
                     })
                     .expect("first worker commit");
            })
        };

        locked_rx.recv().expect("first worker locked");
        let started = Instant::now();
        let seen = store.transaction(&instance, |tx| tx.status_snapshot(&instance, true)).expect("second snapshot");
        let waited = started.elapsed();
        first.join().expect("first worker");

        assert_eq!(seen["approval"], EventStatus::Triggered);
        assert!(waited >= Duration::from_millis(200), "second snapshot returned after {waited:?}");
    }).expect("test store");
}

#[test]
fn cancel_wins_over_concurrent_trigger_intent() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return;
    }
    with_store(|store| {
        let instance = Uuid::new_v4().to_string();
        let mut direct = store.clone();
        let declared = direct.create(&instance, Event::pending(&instance, "timeout", "timer")).expect("seed");
        direct.cancel(&instance, "timeout").expect("cancel");

        // un productor con una copia vieja intenta disparar el evento
        let mut stale = declared;
        stale.trigger("late", "timer_service").expect("local transition");
        let err = direct.update_status_and_data(&instance, &stale).expect_err("cancelled is terminal");
        assert!(matches!(err, EventStoreError::InvalidTransition { from: EventStatus::Cancelled, .. }));
        let stored = direct.find_by_name(&instance, "timeout").expect("find").expect("present");
        assert_eq!(stored.status, EventStatus::Cancelled);
    }).expect("test store");
}

#[test]
fn ignored_duplicate_does_not_discard_the_commit() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return;
    }
    with_store(|store| {
        let instance = Uuid::new_v4().to_string();
        store.transaction(&instance, |tx| {
                 tx.create(&instance, Event::pending(&instance, "kept", "t"))?;
                 let _ = tx.create(&instance, Event::pending(&instance, "kept", "t"));
                 Ok(())
             })
             .expect("commit");
        let mut direct = store.clone();
        assert_eq!(direct.find_all_for_instance(&instance).expect("all").len(), 1);
    }).expect("test store");
}

// READ COMMITTED: otra conexión no ve filas de una transacción abierta.
#[test]
fn uncommitted_writes_are_invisible_to_other_readers() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return;
    }
    with_store(|store| {
        let instance = Uuid::new_v4().to_string();
        let (written_tx, written_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let writer = {
            let store = store.clone();
            let instance = instance.clone();
            thread::spawn(move || {
                store.transaction(&instance, |tx| -> Result<(), EventStoreError> {
                         tx.create(&instance, Event::pending(&instance, "uncommitted", "t"))?;
                         written_tx.send(()).expect("signal");
                         release_rx.recv().expect("release");
                         Err(EventStoreError::Storage("abort".into()))
                     })
            })
        };

        written_rx.recv().expect("writer inserted");
        let mut reader = store.clone();
        assert_eq!(reader.find_by_name(&instance, "uncommitted").expect("find"), None);
        assert!(reader.find_bulk_ordered(&instance, &["uncommitted".to_string()]).expect("bulk").is_empty());
        assert!(reader.status_snapshot(&instance, false).expect("snapshot").is_empty());
        release_tx.send(()).expect("release writer");
        assert!(writer.join().expect("writer").is_err());
        assert_eq!(reader.find_by_name(&instance, "uncommitted").expect("find"), None);
    }).expect("test store");
}
