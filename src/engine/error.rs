use thiserror::Error;
use ulid::Ulid;

use crate::model::LedgerKey;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("permission denied: {requester} may not modify booking {booking}")]
    Permission { requester: Ulid, booking: Ulid },
    #[error("timed out waiting for ledger {0}")]
    Timeout(LedgerKey),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn provider_not_found(id: Ulid) -> Self {
        EngineError::NotFound { kind: "provider", id }
    }

    pub(crate) fn service_not_found(id: Ulid) -> Self {
        EngineError::NotFound { kind: "service", id }
    }

    pub(crate) fn booking_not_found(id: Ulid) -> Self {
        EngineError::NotFound { kind: "booking", id }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Permission { .. } => "permission",
            EngineError::Timeout(_) => "timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
