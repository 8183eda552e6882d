//! Engine-level error taxonomy.

use thiserror::Error;

use crate::conflict::RemoteSnapshot;
use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::StorageError;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Timeout, abort, or connection failure. Always retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Local storage failure. Quota is retryable; corruption is not.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The guarded endpoint is known to be down. Stops a drain cycle early.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The remote changed since this mutation was made. Handled by the
    /// conflict resolver, never surfaced raw.
    #[error("remote version conflict (remote lastModified {})", .0.last_modified)]
    Conflict(RemoteSnapshot),

    /// Structurally invalid mutation. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
}

impl SyncError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Storage(e) => e.is_retryable(),
            Self::CircuitOpen => true,
            Self::Conflict(_) | Self::Validation(_) => false,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Storage(_) => "storage",
            Self::CircuitOpen => "circuit_open",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        Self::Network(err.to_string())
    }
}

impl<E: Into<SyncError>> From<CircuitError<E>> for SyncError {
    fn from(err: CircuitError<E>) -> Self {
        match err {
            CircuitError::Rejected => Self::CircuitOpen,
            CircuitError::Inner(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryability() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Storage(StorageError::QuotaExceeded("full".into())).is_retryable());
        assert!(!SyncError::Storage(StorageError::Corruption {
            namespace: "x".into(),
            detail: "bad".into()
        })
        .is_retryable());
        assert!(!SyncError::Validation("bad payload".into()).is_retryable());
    }

    #[test]
    fn test_transport_and_circuit_conversions() {
        let err: SyncError = TransportError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(err.kind(), "network");

        let rejected: SyncError = CircuitError::<TransportError>::Rejected.into();
        assert_eq!(rejected, SyncError::CircuitOpen);

        let inner: SyncError = CircuitError::Inner(TransportError::Aborted).into();
        assert_eq!(inner, SyncError::Network("request aborted".into()));
    }

    #[test]
    fn test_conflict_message() {
        let err = SyncError::Conflict(RemoteSnapshot {
            last_modified: 7,
            data: serde_json::Value::Null,
        });
        assert_eq!(err.to_string(), "remote version conflict (remote lastModified 7)");
    }
}
