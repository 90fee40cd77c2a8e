//! Demo del Event Store de Flux.
//!
//! Recorre el ciclo de vida de los eventos de una instancia de máquina de
//! estados: declaración de dependencias, disparo, señal que llega antes de
//! ser declarada, cancelación y evaluación bajo lock. Siempre corre sobre el
//! backend en memoria; el backend Postgres es opt-in con
//! `FLUX_RUN_PG_DEMO=1`.

use std::collections::HashMap;

use flux_core::{Event, EventStatus, EventStore, EventStoreError, InMemoryEventStore};
use flux_persistence::config::database_configured;
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

/// Dependencias del estado `ship_order` en la demo.
const DEPENDENCIES: [&str; 3] = ["payment_received", "stock_reserved", "customer_notified"];

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    flux_persistence::init_dotenv();

    println!("--- Event Store en memoria ---");
    let mut mem = InMemoryEventStore::with_shards(4);
    if let Err(e) = run_walkthrough(&mut mem, "MEM") {
        eprintln!("[MEM] Error: {e}");
    }
    let instance = Uuid::new_v4().to_string();
    match evaluate_under_lock(&mem, &instance) {
        Ok(ready) => println!("[MEM] instancia sin eventos lista para avanzar? {ready}"),
        Err(e) => eprintln!("[MEM] Error: {e}"),
    }

    if std::env::var("FLUX_RUN_PG_DEMO").ok().as_deref() == Some("1") {
        maybe_run_pg_demo();
    } else {
        eprintln!("[PG DEMO] Skipping (set FLUX_RUN_PG_DEMO=1 to enable)");
    }
}

/// Escenario completo sobre cualquier backend que implemente `EventStore`.
fn run_walkthrough<S: EventStore>(store: &mut S, label: &str) -> Result<(), EventStoreError> {
    let instance = Uuid::new_v4().to_string();
    info!("[{label}] instancia {instance}");

    // declaración de dependencias al arrancar la instancia
    for name in &DEPENDENCIES[..2] {
        store.create(&instance,
                     Event::pending(&instance, *name, "dependency").with_originating_state("ship_order"))?;
    }

    // llega el pago
    if let Some(mut payment) = store.find_by_name(&instance, "payment_received")? {
        payment.trigger(json!({ "amount": 120, "currency": "EUR" }).to_string(), "billing")?;
        store.update_status_and_data(&instance, &payment)?;
    }

    // señal externa que llega antes de que nadie la declare
    store.create(&instance,
                 Event::triggered(&instance,
                                  "customer_notified",
                                  "notification",
                                  json!({ "channel": "email" }).to_string(),
                                  "mailer"))?;
    match store.create(&instance, Event::pending(&instance, "customer_notified", "notification")) {
        Err(EventStoreError::DuplicateEvent { name, .. }) => println!("[{label}] duplicado rechazado: {name}"),
        Err(e) => return Err(e),
        Ok(_) => warn!("[{label}] se esperaba DuplicateEvent"),
    }

    let triggered = store.find_names_by_status(&instance, &[EventStatus::Triggered])?;
    println!("[{label}] disparados: {triggered:?}");

    // el stock no se pudo reservar: el evento se cancela
    store.cancel(&instance, "stock_reserved")?;
    let resolved = store.find_resolved_names(&instance)?;
    println!("[{label}] resueltos: {resolved:?}");

    let requested: Vec<String> = vec!["customer_notified".into(), "payment_received".into(), "never_declared".into()];
    for data in store.find_bulk_ordered(&instance, &requested)? {
        println!("[{label}] payload {} ({}) <- {:?}", data.name, data.event_type, data.data);
    }

    let snapshot = store.status_snapshot(&instance, false)?;
    println!("[{label}] snapshot: {}", format_snapshot(&snapshot));
    Ok(())
}

/// Evalúa las dependencias de `ship_order` con el snapshot bloqueante, tal
/// como lo haría un worker antes de ejecutar la transición.
fn evaluate_under_lock(store: &InMemoryEventStore, instance: &str) -> Result<bool, EventStoreError> {
    store.transaction(instance, |tx| {
             let snapshot = tx.status_snapshot(instance, true)?;
             Ok(dependencies_ready(&snapshot))
         })
}

fn dependencies_ready(snapshot: &HashMap<String, EventStatus>) -> bool {
    snapshot.values().all(|s| s.is_resolved())
}

fn format_snapshot(snapshot: &HashMap<String, EventStatus>) -> String {
    let mut pairs: Vec<_> = snapshot.iter().map(|(n, s)| format!("{n}={s}")).collect();
    pairs.sort();
    pairs.join(", ")
}

fn maybe_run_pg_demo() {
    if !database_configured() {
        eprintln!("[PG DEMO] FLUX_SHARD_URLS / DATABASE_URL no definidos; omitiendo demo PG");
        return;
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.to_lowercase().contains("gssencmode=") && std::env::var("PGGSSENCMODE").is_err() {
            std::env::set_var("PGGSSENCMODE", "disable");
            eprintln!("[PG DEMO] PGGSSENCMODE=disable (auto) para evitar issues GSS/libpq");
        }
    }
    let mut store = match flux_persistence::build_dev_store_from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[PG DEMO] Error construyendo el store: {e}");
            return;
        }
    };
    println!("--- Event Store Postgres ---");
    if let Err(e) = run_walkthrough(&mut store, "PG") {
        eprintln!("[PG DEMO] Error: {e}");
    }

    let instance = Uuid::new_v4().to_string();
    let outcome = store.transaction(&instance, |tx| {
                           tx.create(&instance, Event::pending(&instance, "approval", "human"))?;
                           let snapshot = tx.status_snapshot(&instance, true)?;
                           Ok(dependencies_ready(&snapshot))
                       });
    match outcome {
        Ok(ready) => println!("[PG] aprobación pendiente, lista para avanzar? {ready}"),
        Err(e) => eprintln!("[PG DEMO] Error (lock): {e}"),
    }
}
