//! flux-core: capa de persistencia y consulta de eventos del orquestador.
//!
//! - `event`: entidad `Event`, DTO `EventData`, trait `EventStore` y backend
//!   en memoria con la misma semántica que el backend Postgres.
//! - `shard`: Shard Router determinista (`instance_id -> ShardId`).
//! - `errors`: `EventStoreError`, el único error que cruza la frontera.
pub mod errors;
pub mod event;
pub mod shard;

#[cfg(any(test, feature = "test-utils"))]
pub mod contract;

pub use errors::EventStoreError;
pub use event::{Event, EventData, EventStatus, EventStore, InMemoryEventStore, InMemoryTx};
pub use shard::{HashShardRouter, ShardId, ShardRouter};
