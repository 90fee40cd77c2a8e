//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y, en la frontera,
//! a `EventStoreError`.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use flux_core::EventStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl PersistenceError {
    /// Determina si un error es transitorio (el llamador puede reintentar).
    ///
    /// Cubre conflictos de serialización, fallos de pool/conexión y, por
    /// texto (best-effort, sin acoplar a SQLSTATE), deadlocks y esperas de
    /// lock agotadas.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::SerializationConflict | PersistenceError::TransientIo(_) => true,
            PersistenceError::Unknown(msg) => {
                let m = msg.to_lowercase();
                m.contains("deadlock detected")
                || m.contains("could not serialize access due to concurrent update")
                || m.contains("lock timeout")
                || m.contains("terminating connection due to administrator command")
                || m.contains("connection closed")
                || m.contains("connection refused")
            }
            _ => false,
        }
    }
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Unknown(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::RollbackErrorOnCommit { rollback_error, commit_error } => {
                Self::Unknown(format!("rollback={rollback_error}; commit={commit_error}"))
            }
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            DieselError::QueryBuilderError(e) => Self::Unknown(format!("query builder: {e}")),
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<PersistenceError> for EventStoreError {
    fn from(err: PersistenceError) -> Self {
        if err.is_retryable() {
            EventStoreError::StorageUnavailable(err.to_string())
        } else {
            EventStoreError::Storage(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_become_storage_unavailable() {
        let e: EventStoreError = PersistenceError::TransientIo("pool timed out".into()).into();
        assert!(e.is_retryable());
        let e: EventStoreError = PersistenceError::SerializationConflict.into();
        assert!(matches!(e, EventStoreError::StorageUnavailable(_)));
        let e: EventStoreError =
            PersistenceError::Unknown("canceling statement due to lock timeout".into()).into();
        assert!(e.is_retryable());
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        let e: EventStoreError = PersistenceError::CheckViolation("events_status_check".into()).into();
        assert!(matches!(e, EventStoreError::Storage(_)));
        assert!(!e.is_retryable());
        assert!(!PersistenceError::Config("x".into()).is_retryable());
        let e = PersistenceError::Unknown("invalid value for parameter \"statement_timeout\": \"abc\"".into());
        assert!(!e.is_retryable());
    }

    #[test]
    fn diesel_not_found_maps() {
        assert!(matches!(PersistenceError::from(DieselError::NotFound), PersistenceError::NotFound));
        assert!(PersistenceError::from(DieselError::BrokenTransactionManager).is_retryable());
    }
}
