use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("table already reserved for this time")]
    Conflict(Vec<Ulid>),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Coarse outcome class; the HTTP layer maps it to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Storage,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn table_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("table {id}"))
    }

    pub fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("reservation {id}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyExists(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}
