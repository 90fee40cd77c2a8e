use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use flux_core::event::ordering::{distinct_names, order_by_requested_names, status_labels};
use flux_core::{Event, EventData, EventStatus, EventStore, EventStoreError, HashShardRouter, ShardId, ShardRouter};
use log::{debug, warn};

use super::ConnectionProvider;
use crate::error::PersistenceError;
use crate::schema::events;

/// Fila mapeada de la tabla `events` para lecturas.
///
/// El orden de los campos es el de las columnas en `schema.rs` (select por
/// defecto de Diesel).
#[derive(Queryable, Debug)]
pub struct EventRow {
    pub id: i64,
    pub state_machine_instance_id: String,
    pub name: String,
    pub event_type: String,
    pub status: String,
    pub event_data: Option<String>,
    pub event_source: Option<String>,
    pub originating_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRow {
    pub fn into_event(self) -> Result<Event, EventStoreError> {
        Ok(Event { id: Some(self.id),
                   state_machine_instance_id: self.state_machine_instance_id,
                   name: self.name,
                   event_type: self.event_type,
                   status: self.status.parse()?,
                   event_data: self.event_data,
                   event_source: self.event_source,
                   originating_state: self.originating_state,
                   created_at: Some(self.created_at),
                   updated_at: Some(self.updated_at) })
    }
}

/// Estructura para inserción en `events`; `id`, `created_at` y `updated_at`
/// los asigna la base y vuelven vía `RETURNING`.
#[derive(Insertable, Debug)]
#[diesel(table_name = events)]
pub struct NewEventRow<'a> {
    pub state_machine_instance_id: &'a str,
    pub name: &'a str,
    pub event_type: &'a str,
    pub status: &'a str,
    pub event_data: Option<&'a str>,
    pub event_source: Option<&'a str>,
    pub originating_state: Option<&'a str>,
}

fn db_err(e: DieselError) -> EventStoreError {
    let err = PersistenceError::from(e);
    if err.is_retryable() {
        warn!("retryable storage failure: {err}");
    }
    err.into()
}

fn create_err(instance_id: &str, name: &str, e: DieselError) -> EventStoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            EventStoreError::DuplicateEvent { instance_id: instance_id.to_string(),
                                              name: name.to_string() }
        }
        other => db_err(other),
    }
}

fn parse_pairs(rows: Vec<(String, String)>) -> Result<Vec<(String, EventStatus)>, EventStoreError> {
    rows.into_iter().map(|(name, status)| Ok((name, status.parse()?))).collect()
}

// Error interno del closure de transacción: Diesel exige `E: From<diesel::result::Error>`.
enum TxFailure {
    Store(EventStoreError),
    Db(DieselError),
}

impl From<DieselError> for TxFailure {
    fn from(e: DieselError) -> Self {
        TxFailure::Db(e)
    }
}

impl From<TxFailure> for EventStoreError {
    fn from(f: TxFailure) -> Self {
        match f {
            TxFailure::Store(e) => e,
            TxFailure::Db(e) => db_err(e),
        }
    }
}

/// Repositorio Postgres de eventos: pools por shard + router explícito.
///
/// Responsabilidades:
/// - `transaction`: abrir una transacción read-write en el shard de la
///   instancia y entregar el handle `PgEventTx`.
/// - `EventStore` directo: cada llamada en su propia transacción.
#[derive(Clone)]
pub struct PgEventStore<P: ConnectionProvider, R: ShardRouter = HashShardRouter> {
    provider: P,
    router: R,
}

impl<P: ConnectionProvider, R: ShardRouter> PgEventStore<P, R> {
    pub fn new(provider: P, router: R) -> Self {
        Self { provider, router }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn shard_for(&self, instance_id: &str) -> ShardId {
        self.router.shard_for(instance_id)
    }

    /// Ejecuta `f` dentro de una transacción del shard de `instance_id`.
    ///
    /// Commit si `f` devuelve `Ok`; rollback ante `Err` o panic. La conexión
    /// vuelve al pool al salir, en cualquier caso.
    pub fn transaction<T, F>(&self, instance_id: &str, f: F) -> Result<T, EventStoreError>
        where F: FnOnce(&mut PgEventTx<'_, R>) -> Result<T, EventStoreError>
    {
        let shard = self.router.shard_for(instance_id);
        if shard.index() >= self.provider.shard_count() {
            return Err(EventStoreError::UnknownShard(shard));
        }
        let mut conn = self.provider.connection(shard)?;
        debug!("transaction:begin instance={instance_id} {shard}");
        let result = conn.build_transaction()
                         .read_write()
                         .run(|tx_conn| {
                             let mut tx = PgEventTx { conn: tx_conn, shard, router: &self.router };
                             f(&mut tx).map_err(TxFailure::Store)
                         });
        match result {
            Ok(v) => {
                debug!("transaction:commit instance={instance_id} {shard}");
                Ok(v)
            }
            Err(TxFailure::Store(e)) => {
                debug!("transaction:rollback instance={instance_id} {shard} err={e}");
                Err(e)
            }
            Err(TxFailure::Db(e)) => Err(db_err(e)),
        }
    }
}

/// Handle transaccional explícito: todas las operaciones corren sobre la
/// conexión de la transacción abierta por `PgEventStore::transaction`.
pub struct PgEventTx<'c, R: ShardRouter> {
    conn: &'c mut PgConnection,
    shard: ShardId,
    router: &'c R,
}

impl<R: ShardRouter> PgEventTx<'_, R> {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    fn route(&self, instance_id: &str) -> Result<(), EventStoreError> {
        let actual = self.router.shard_for(instance_id);
        if actual != self.shard {
            return Err(EventStoreError::ShardMismatch { instance_id: instance_id.to_string(),
                                                        expected: self.shard,
                                                        actual });
        }
        Ok(())
    }
}

impl<R: ShardRouter> EventStore for PgEventTx<'_, R> {
    fn create(&mut self, instance_id: &str, event: Event) -> Result<Event, EventStoreError> {
        self.route(instance_id)?;
        debug!("create:start instance={instance_id} name={}", event.name);
        let row = NewEventRow { state_machine_instance_id: instance_id,
                                name: &event.name,
                                event_type: &event.event_type,
                                status: event.status.as_str(),
                                event_data: event.event_data.as_deref(),
                                event_source: event.event_source.as_deref(),
                                originating_state: event.originating_state.as_deref() };
        // savepoint: un duplicado no aborta la transacción del llamador
        let inserted: EventRow =
            self.conn
                .transaction::<_, DieselError, _>(|c| diesel::insert_into(events::table).values(&row).get_result(c))
                .map_err(|e| create_err(instance_id, &event.name, e))?;
        debug!("create:done instance={instance_id} name={} id={}", inserted.name, inserted.id);
        inserted.into_event()
    }

    fn update_status_and_data(&mut self, instance_id: &str, event: &Event) -> Result<(), EventStoreError> {
        self.route(instance_id)?;
        let id = event.id.ok_or_else(|| EventStoreError::MissingIdentity { name: event.name.clone() })?;
        let current = self.conn.transaction::<_, TxFailure, _>(|c| {
                                   let stored: Option<String> = events::table.filter(events::id.eq(id))
                                                                             .filter(events::state_machine_instance_id.eq(instance_id))
                                                                             .select(events::status)
                                                                             .for_update()
                                                                             .get_result(c)
                                                                             .optional()?;
                                   let current: EventStatus =
                                       stored.ok_or_else(|| EventStoreError::EventNotFound { instance_id: instance_id.to_string(),
                                                                                              id })
                                             .and_then(|s| s.parse())
                                             .map_err(TxFailure::Store)?;
                                   if !current.can_transition_to(event.status) {
                                       return Err(TxFailure::Store(EventStoreError::InvalidTransition { name: event.name.clone(),
                                                                                                        from: current,
                                                                                                        to: event.status }));
                                   }
                                   diesel::update(events::table.filter(events::id.eq(id))
                                                               .filter(events::state_machine_instance_id.eq(instance_id)))
                                       .set((events::status.eq(event.status.as_str()),
                                             events::event_data.eq(event.event_data.as_deref()),
                                             events::event_source.eq(event.event_source.as_deref()),
                                             events::updated_at.eq(Utc::now())))
                                       .execute(c)?;
                                   Ok(current)
                               })?;
        debug!("update:done instance={instance_id} id={id} {current} -> {}", event.status);
        Ok(())
    }

    fn find_all_for_instance(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.route(instance_id)?;
        let rows: Vec<EventRow> = events::table.filter(events::state_machine_instance_id.eq(instance_id))
                                               .load(self.conn)
                                               .map_err(db_err)?;
        debug!("find_all:done instance={instance_id} count={}", rows.len());
        rows.into_iter().map(EventRow::into_event).collect()
    }

    fn find_by_name(&mut self, instance_id: &str, name: &str) -> Result<Option<Event>, EventStoreError> {
        self.route(instance_id)?;
        events::table.filter(events::state_machine_instance_id.eq(instance_id))
                     .filter(events::name.eq(name))
                     .first::<EventRow>(self.conn)
                     .optional()
                     .map_err(db_err)?
                     .map(EventRow::into_event)
                     .transpose()
    }

    fn find_names_by_status(&mut self,
                            instance_id: &str,
                            statuses: &[EventStatus])
                            -> Result<Vec<String>, EventStoreError> {
        self.route(instance_id)?;
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        events::table.filter(events::state_machine_instance_id.eq(instance_id))
                     .filter(events::status.eq_any(status_labels(statuses)))
                     .select(events::name)
                     .load::<String>(self.conn)
                     .map_err(db_err)
    }

    fn find_status_by_status(&mut self,
                             instance_id: &str,
                             statuses: &[EventStatus])
                             -> Result<Vec<(String, EventStatus)>, EventStoreError> {
        self.route(instance_id)?;
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String)> = events::table.filter(events::state_machine_instance_id.eq(instance_id))
                                                       .filter(events::status.eq_any(status_labels(statuses)))
                                                       .select((events::name, events::status))
                                                       .load(self.conn)
                                                       .map_err(db_err)?;
        parse_pairs(rows)
    }

    fn find_triggered(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.route(instance_id)?;
        let rows: Vec<EventRow> = events::table.filter(events::state_machine_instance_id.eq(instance_id))
                                               .filter(events::status.eq(EventStatus::Triggered.as_str()))
                                               .load(self.conn)
                                               .map_err(db_err)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    fn find_bulk_ordered(&mut self, instance_id: &str, names: &[String]) -> Result<Vec<EventData>, EventStoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        self.route(instance_id)?;
        let rows: Vec<(String, String, Option<String>, Option<String>)> =
            events::table.filter(events::state_machine_instance_id.eq(instance_id))
                         .filter(events::name.eq_any(distinct_names(names)))
                         .select((events::name, events::event_type, events::event_data, events::event_source))
                         .load(self.conn)
                         .map_err(db_err)?;
        let dtos = rows.into_iter()
                       .map(|(name, event_type, data, source)| EventData { name, event_type, data, source })
                       .collect();
        Ok(order_by_requested_names(names, dtos))
    }

    fn status_snapshot(&mut self,
                       instance_id: &str,
                       lock_for_update: bool)
                       -> Result<HashMap<String, EventStatus>, EventStoreError> {
        self.route(instance_id)?;
        let query = events::table.filter(events::state_machine_instance_id.eq(instance_id))
                                 .select((events::name, events::status));
        let loaded: QueryResult<Vec<(String, String)>> =
            if lock_for_update { query.for_update().load(self.conn) } else { query.load(self.conn) };
        let rows = loaded.map_err(db_err)?;
        debug!("status_snapshot:done instance={instance_id} locked={lock_for_update} count={}", rows.len());
        Ok(parse_pairs(rows)?.into_iter().collect())
    }

    fn cancel(&mut self, instance_id: &str, name: &str) -> Result<(), EventStoreError> {
        self.route(instance_id)?;
        let affected = self.conn
                           .transaction::<_, DieselError, _>(|c| {
                               diesel::update(events::table.filter(events::state_machine_instance_id.eq(instance_id))
                                                           .filter(events::name.eq(name)))
                                   .set((events::status.eq(EventStatus::Cancelled.as_str()),
                                         events::updated_at.eq(Utc::now())))
                                   .execute(c)
                           })
                           .map_err(db_err)?;
        debug!("cancel:done instance={instance_id} name={name} affected={affected}");
        Ok(())
    }
}

/// Cada llamada directa sobre el store corre en su propia transacción.
impl<P: ConnectionProvider, R: ShardRouter> EventStore for PgEventStore<P, R> {
    fn create(&mut self, instance_id: &str, event: Event) -> Result<Event, EventStoreError> {
        self.transaction(instance_id, |tx| tx.create(instance_id, event))
    }

    fn update_status_and_data(&mut self, instance_id: &str, event: &Event) -> Result<(), EventStoreError> {
        self.transaction(instance_id, |tx| tx.update_status_and_data(instance_id, event))
    }

    fn find_all_for_instance(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.find_all_for_instance(instance_id))
    }

    fn find_by_name(&mut self, instance_id: &str, name: &str) -> Result<Option<Event>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.find_by_name(instance_id, name))
    }

    fn find_names_by_status(&mut self,
                            instance_id: &str,
                            statuses: &[EventStatus])
                            -> Result<Vec<String>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.find_names_by_status(instance_id, statuses))
    }

    fn find_status_by_status(&mut self,
                             instance_id: &str,
                             statuses: &[EventStatus])
                             -> Result<Vec<(String, EventStatus)>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.find_status_by_status(instance_id, statuses))
    }

    fn find_triggered(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.find_triggered(instance_id))
    }

    fn find_bulk_ordered(&mut self, instance_id: &str, names: &[String]) -> Result<Vec<EventData>, EventStoreError> {
        // sin nombres no hay query posible: ni checkout de conexión ni transacción
        if names.is_empty() {
            return Ok(Vec::new());
        }
        self.transaction(instance_id, |tx| tx.find_bulk_ordered(instance_id, names))
    }

    fn status_snapshot(&mut self,
                       instance_id: &str,
                       lock_for_update: bool)
                       -> Result<HashMap<String, EventStatus>, EventStoreError> {
        self.transaction(instance_id, |tx| tx.status_snapshot(instance_id, lock_for_update))
    }

    fn cancel(&mut self, instance_id: &str, name: &str) -> Result<(), EventStoreError> {
        self.transaction(instance_id, |tx| tx.cancel(instance_id, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::PgPooledConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider sin base: cuenta los checkouts y siempre falla.
    #[derive(Clone, Default)]
    struct UnreachableProvider {
        checkouts: Arc<AtomicUsize>,
    }

    impl ConnectionProvider for UnreachableProvider {
        fn connection(&self, _shard: ShardId) -> Result<PgPooledConnection, PersistenceError> {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::TransientIo("connection refused".into()))
        }

        fn shard_count(&self) -> usize {
            2
        }
    }

    #[test]
    fn empty_bulk_lookup_never_touches_storage() {
        let provider = UnreachableProvider::default();
        let checkouts = Arc::clone(&provider.checkouts);
        let mut store = PgEventStore::new(provider, HashShardRouter::new(2));
        assert_eq!(store.find_bulk_ordered("sm-1", &[]).unwrap(), Vec::<EventData>::new());
        assert_eq!(checkouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_failure_surfaces_as_retryable() {
        let provider = UnreachableProvider::default();
        let checkouts = Arc::clone(&provider.checkouts);
        let mut store = PgEventStore::new(provider, HashShardRouter::new(2));
        let err = store.find_bulk_ordered("sm-1", &["event1".to_string()]).unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
        assert_eq!(checkouts.load(Ordering::SeqCst), 1);
        assert!(store.cancel("sm-1", "event1").unwrap_err().is_retryable());
    }

    #[test]
    fn router_outside_configured_shards_fails_before_checkout() {
        let provider = UnreachableProvider::default();
        let checkouts = Arc::clone(&provider.checkouts);
        let mut store = PgEventStore::new(provider, |_: &str| ShardId(5));
        assert_eq!(store.find_all_for_instance("sm-1").unwrap_err(), EventStoreError::UnknownShard(ShardId(5)));
        assert_eq!(checkouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn row_with_unknown_status_is_rejected() {
        let row = EventRow { id: 1,
                             state_machine_instance_id: "sm".into(),
                             name: "e".into(),
                             event_type: "t".into(),
                             status: "archived".into(),
                             event_data: None,
                             event_source: None,
                             originating_state: None,
                             created_at: Utc::now(),
                             updated_at: Utc::now() };
        assert_eq!(row.into_event(), Err(EventStoreError::UnknownStatus("archived".into())));
    }
}
