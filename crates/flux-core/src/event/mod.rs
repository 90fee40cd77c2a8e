//! Eventos de un workflow instance: entidad, DTO, contrato `EventStore` y
//! backend en memoria.

pub mod ordering;
mod store;
mod types;

pub use store::{EventStore, InMemoryEventStore, InMemoryTx};
pub use types::{Event, EventData, EventStatus};
