//! Errores del Event Store (frontera con el motor de orquestación).

use thiserror::Error;

use crate::event::EventStatus;
use crate::shard::ShardId;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EventStoreError {
    #[error("event '{name}' already exists for state machine instance {instance_id}")]
    DuplicateEvent { instance_id: String, name: String },
    #[error("event id={id} not found for state machine instance {instance_id}")]
    EventNotFound { instance_id: String, id: i64 },
    #[error("event '{name}' has no storage identity (not persisted yet)")]
    MissingIdentity { name: String },
    #[error("invalid status transition for event '{name}': {from} -> {to}")]
    InvalidTransition { name: String, from: EventStatus, to: EventStatus },
    #[error("unknown event status: {0}")]
    UnknownStatus(String),
    #[error("instance {instance_id} routes to shard {actual}, transaction is bound to shard {expected}")]
    ShardMismatch { instance_id: String, expected: ShardId, actual: ShardId },
    #[error("no partition configured for shard {0}")]
    UnknownShard(ShardId),
    #[error("storage unavailable (retryable): {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EventStoreError {
    /// `true` sólo para fallos transitorios; esta capa nunca reintenta por su cuenta.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}
