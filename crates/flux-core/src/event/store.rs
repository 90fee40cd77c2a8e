use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use super::ordering::{distinct_names, order_by_requested_names};
use super::{Event, EventData, EventStatus};
use crate::errors::EventStoreError;
use crate::shard::{HashShardRouter, ShardId, ShardRouter};

/// Contrato completo que el motor de orquestación usa sobre los eventos.
///
/// Todas las operaciones reciben el `instance_id`, que determina la partición.
/// Las implementaciones "transaccionales" (`PgEventTx`, `InMemoryTx`) ejecutan
/// dentro de la transacción abierta por el llamador; las implementaciones sobre
/// el store completo abren una transacción por llamada.
pub trait EventStore {
    /// Inserta una fila nueva. `DuplicateEvent` si `(instance_id, name)` existe.
    fn create(&mut self, instance_id: &str, event: Event) -> Result<Event, EventStoreError>;

    /// Persiste `status`, `event_data` y `event_source` de una identidad existente.
    fn update_status_and_data(&mut self, instance_id: &str, event: &Event) -> Result<(), EventStoreError>;

    /// Todos los eventos de la instancia, sin orden garantizado.
    fn find_all_for_instance(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError>;

    fn find_by_name(&mut self, instance_id: &str, name: &str) -> Result<Option<Event>, EventStoreError>;

    /// Proyección sólo-nombre filtrada por estado (no carga payloads).
    fn find_names_by_status(&mut self,
                            instance_id: &str,
                            statuses: &[EventStatus])
                            -> Result<Vec<String>, EventStoreError>;

    /// Proyección nombre+estado filtrada por estado.
    fn find_status_by_status(&mut self,
                             instance_id: &str,
                             statuses: &[EventStatus])
                             -> Result<Vec<(String, EventStatus)>, EventStoreError>;

    fn find_triggered(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError>;

    /// DTOs en el orden exacto de `names`. Lista vacía => `[]` sin tocar el storage.
    fn find_bulk_ordered(&mut self, instance_id: &str, names: &[String]) -> Result<Vec<EventData>, EventStoreError>;

    /// `name -> status` de toda la instancia. Con `lock_for_update` las filas
    /// quedan bloqueadas hasta que termina la transacción del llamador.
    fn status_snapshot(&mut self,
                       instance_id: &str,
                       lock_for_update: bool)
                       -> Result<HashMap<String, EventStatus>, EventStoreError>;

    /// Update por predicado a `cancelled`. Idempotente; cero filas no es error.
    fn cancel(&mut self, instance_id: &str, name: &str) -> Result<(), EventStoreError>;

    /// Nombres de eventos `triggered` o `cancelled`.
    fn find_resolved_names(&mut self, instance_id: &str) -> Result<Vec<String>, EventStoreError> {
        self.find_names_by_status(instance_id, &EventStatus::RESOLVED)
    }
}

#[derive(Default)]
struct Partition {
    // sólo datos confirmados
    rows: HashMap<String, Vec<Event>>,
    // instance_id -> tx que sostiene el lock
    locks: HashMap<String, u64>,
    // tx en espera -> tx que sostiene el lock que espera
    waiting: HashMap<u64, u64>,
}

impl Partition {
    fn instance(&self, instance_id: &str) -> &[Event] {
        self.rows.get(instance_id).map(Vec::as_slice).unwrap_or_default()
    }

    fn holder_other_than(&self, instance_id: &str, tx_id: u64) -> Option<u64> {
        self.locks.get(instance_id).copied().filter(|holder| *holder != tx_id)
    }

    /// `true` si la cadena de esperas que parte de `from` llega a `target`.
    fn waits_on(&self, from: u64, target: u64) -> bool {
        let mut current = from;
        for _ in 0..=self.waiting.len() {
            if current == target {
                return true;
            }
            match self.waiting.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }
}

// Reemplaza la fila con el mismo nombre o la agrega al final.
fn merge_row(rows: &mut Vec<Event>, event: Event) {
    match rows.iter_mut().find(|e| e.name == event.name) {
        Some(row) => *row = event,
        None => rows.push(event),
    }
}

#[derive(Default)]
struct Shard {
    state: Mutex<Partition>,
    released: Condvar,
}

impl Shard {
    fn state(&self) -> MutexGuard<'_, Partition> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner<R> {
    router: R,
    shards: Vec<Shard>,
    next_id: AtomicI64,
    next_tx: AtomicU64,
}

/// Backend en memoria con la misma semántica observable que el backend
/// Postgres: particiones por shard, unicidad `(instance, name)`, rollback
/// ante error y bloqueo por instancia para `status_snapshot(.., true)`.
///
/// Modelo de aislamiento: las escrituras quedan en la transacción que las
/// hizo y se aplican a la partición recién en el commit, así que las
/// lecturas de otras transacciones sólo ven datos confirmados (como READ
/// COMMITTED).
///
/// Modelo de locks: un lock exclusivo por instancia (más grueso que el lock
/// por fila de Postgres), tomado por los snapshots bloqueantes y por las
/// escrituras, y liberado al terminar la transacción. Un ciclo de esperas
/// entre transacciones se corta con `StorageUnavailable` para la que lo
/// cierra, igual que un `deadlock detected` de Postgres. Las lecturas sin
/// lock nunca esperan.
pub struct InMemoryEventStore<R: ShardRouter = HashShardRouter> {
    inner: Arc<Inner<R>>,
}

impl<R: ShardRouter> Clone for InMemoryEventStore<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(HashShardRouter::default(), 1)
    }
}

impl InMemoryEventStore {
    /// `shard_count` particiones enrutadas por `HashShardRouter`.
    pub fn with_shards(shard_count: u16) -> Self {
        let router = HashShardRouter::new(shard_count);
        Self::new(router, router.shard_count())
    }
}

impl<R: ShardRouter> InMemoryEventStore<R> {
    pub fn new(router: R, shard_count: u16) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Self { inner: Arc::new(Inner { router,
                                       shards,
                                       next_id: AtomicI64::new(1),
                                       next_tx: AtomicU64::new(1) }) }
    }

    pub fn shard_for(&self, instance_id: &str) -> ShardId {
        self.inner.router.shard_for(instance_id)
    }

    /// Ejecuta `f` en una transacción ligada a la partición de `instance_id`.
    ///
    /// `Ok` confirma; `Err` (o un panic dentro de `f`) descarta todas las
    /// escrituras hechas por `tx`. Los locks se liberan en todos los casos.
    pub fn transaction<T, F>(&self, instance_id: &str, f: F) -> Result<T, EventStoreError>
        where F: FnOnce(&mut InMemoryTx<'_, R>) -> Result<T, EventStoreError>
    {
        let shard = self.inner.router.shard_for(instance_id);
        if shard.index() >= self.inner.shards.len() {
            return Err(EventStoreError::UnknownShard(shard));
        }
        let mut tx = InMemoryTx { store: &self.inner,
                                  shard,
                                  tx_id: self.inner.next_tx.fetch_add(1, Ordering::Relaxed),
                                  staged: HashMap::new() };
        let result = f(&mut tx);
        if result.is_ok() {
            tx.commit();
        }
        drop(tx);
        result
    }
}

/// Handle transaccional del backend en memoria.
pub struct InMemoryTx<'s, R: ShardRouter> {
    store: &'s Inner<R>,
    shard: ShardId,
    tx_id: u64,
    // escrituras sin confirmar: instance_id -> filas nuevas o reemplazadas
    staged: HashMap<String, Vec<Event>>,
}

impl<'s, R: ShardRouter> InMemoryTx<'s, R> {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    fn partition(&self) -> &'s Shard {
        &self.store.shards[self.shard.index()]
    }

    fn route(&self, instance_id: &str) -> Result<(), EventStoreError> {
        let actual = self.store.router.shard_for(instance_id);
        if actual != self.shard {
            return Err(EventStoreError::ShardMismatch { instance_id: instance_id.to_string(),
                                                        expected: self.shard,
                                                        actual });
        }
        Ok(())
    }

    /// Filas confirmadas de la instancia con las escrituras propias encima.
    fn visible(&self, part: &Partition, instance_id: &str) -> Vec<Event> {
        let mut rows = part.instance(instance_id).to_vec();
        for event in self.staged.get(instance_id).into_iter().flatten() {
            merge_row(&mut rows, event.clone());
        }
        rows
    }

    fn read(&self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.route(instance_id)?;
        let part = self.partition().state();
        Ok(self.visible(&part, instance_id))
    }

    /// Espera a que ninguna otra transacción sostenga el lock de la instancia
    /// y lo toma hasta el final de esta transacción. Devuelve las filas
    /// visibles ya bajo el lock.
    fn lock_instance(&self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.route(instance_id)?;
        let shard = self.partition();
        let tx_id = self.tx_id;
        let mut part = shard.state();
        while let Some(holder) = part.holder_other_than(instance_id, tx_id) {
            if part.waits_on(holder, tx_id) {
                return Err(EventStoreError::StorageUnavailable(format!("deadlock detected: tx {tx_id} waits for \
                                                                        {instance_id} held by tx {holder}")));
            }
            part.waiting.insert(tx_id, holder);
            part = shard.released.wait(part).unwrap_or_else(PoisonError::into_inner);
            part.waiting.remove(&tx_id);
        }
        part.locks.insert(instance_id.to_string(), tx_id);
        Ok(self.visible(&part, instance_id))
    }

    fn stage(&mut self, instance_id: &str, event: Event) {
        merge_row(self.staged.entry(instance_id.to_string()).or_default(), event);
    }

    fn commit(&mut self) {
        let mut part = self.partition().state();
        for (instance_id, events) in self.staged.drain() {
            let rows = part.rows.entry(instance_id).or_default();
            for event in events {
                merge_row(rows, event);
            }
        }
    }
}

impl<R: ShardRouter> Drop for InMemoryTx<'_, R> {
    fn drop(&mut self) {
        let shard = self.partition();
        let mut part = shard.state();
        let tx_id = self.tx_id;
        part.locks.retain(|_, holder| *holder != tx_id);
        part.waiting.remove(&tx_id);
        drop(part);
        shard.released.notify_all();
    }
}

impl<R: ShardRouter> EventStore for InMemoryTx<'_, R> {
    fn create(&mut self, instance_id: &str, mut event: Event) -> Result<Event, EventStoreError> {
        let rows = self.lock_instance(instance_id)?;
        if rows.iter().any(|e| e.name == event.name) {
            return Err(EventStoreError::DuplicateEvent { instance_id: instance_id.to_string(),
                                                         name: event.name });
        }
        let now = Utc::now();
        event.id = Some(self.store.next_id.fetch_add(1, Ordering::Relaxed));
        event.state_machine_instance_id = instance_id.to_string();
        event.created_at = Some(now);
        event.updated_at = Some(now);
        self.stage(instance_id, event.clone());
        Ok(event)
    }

    fn update_status_and_data(&mut self, instance_id: &str, event: &Event) -> Result<(), EventStoreError> {
        let id = event.id.ok_or_else(|| EventStoreError::MissingIdentity { name: event.name.clone() })?;
        let rows = self.lock_instance(instance_id)?;
        let mut row = rows.into_iter()
                          .find(|e| e.id == Some(id))
                          .ok_or_else(|| EventStoreError::EventNotFound { instance_id: instance_id.to_string(), id })?;
        if !row.status.can_transition_to(event.status) {
            return Err(EventStoreError::InvalidTransition { name: row.name,
                                                            from: row.status,
                                                            to: event.status });
        }
        row.status = event.status;
        row.event_data = event.event_data.clone();
        row.event_source = event.event_source.clone();
        row.updated_at = Some(Utc::now());
        self.stage(instance_id, row);
        Ok(())
    }

    fn find_all_for_instance(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.read(instance_id)
    }

    fn find_by_name(&mut self, instance_id: &str, name: &str) -> Result<Option<Event>, EventStoreError> {
        Ok(self.read(instance_id)?.into_iter().find(|e| e.name == name))
    }

    fn find_names_by_status(&mut self,
                            instance_id: &str,
                            statuses: &[EventStatus])
                            -> Result<Vec<String>, EventStoreError> {
        Ok(self.find_status_by_status(instance_id, statuses)?.into_iter().map(|(name, _)| name).collect())
    }

    fn find_status_by_status(&mut self,
                             instance_id: &str,
                             statuses: &[EventStatus])
                             -> Result<Vec<(String, EventStatus)>, EventStoreError> {
        Ok(self.read(instance_id)?
               .into_iter()
               .filter(|e| statuses.contains(&e.status))
               .map(|e| (e.name, e.status))
               .collect())
    }

    fn find_triggered(&mut self, instance_id: &str) -> Result<Vec<Event>, EventStoreError> {
        Ok(self.read(instance_id)?.into_iter().filter(|e| e.status == EventStatus::Triggered).collect())
    }

    fn find_bulk_ordered(&mut self, instance_id: &str, names: &[String]) -> Result<Vec<EventData>, EventStoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = distinct_names(names).into_iter().collect();
        let rows: Vec<EventData> = self.read(instance_id)?
                                       .iter()
                                       .filter(|e| wanted.contains(e.name.as_str()))
                                       .map(EventData::from)
                                       .collect();
        Ok(order_by_requested_names(names, rows))
    }

    fn status_snapshot(&mut self,
                       instance_id: &str,
                       lock_for_update: bool)
                       -> Result<HashMap<String, EventStatus>, EventStoreError> {
        let rows = if lock_for_update { self.lock_instance(instance_id)? } else { self.read(instance_id)? };
        Ok(rows.into_iter().map(|e| (e.name, e.status)).collect())
    }

    fn cancel(&mut self, instance_id: &str, name: &str) -> Result<(), EventStoreError> {
        let rows = self.lock_instance(instance_id)?;
        let Some(mut row) = rows.into_iter().find(|e| e.name == name) else {
            return Ok(());
        };
        row.status = EventStatus::Cancelled;
        row.updated_at = Some(Utc::now());
        self.stage(instance_id, row);
        Ok(())
    }
}

/// Cada llamada directa sobre el store corre en su propia transacción.
impl<R: ShardRouter> EventStore for InMemoryEventStore<R> {
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
