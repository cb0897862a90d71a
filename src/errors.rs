//! Error types for the object pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Shared, type-erased error reported by a [`Manager`](crate::Manager).
///
/// Collaborator errors are kept behind an `Arc` so the circuit breaker can
/// hand the same cached error to every caller it short-circuits.
pub type BackendError = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for a pool slot")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Failed to create object: {0}")]
    Construction(#[source] BackendError),

    #[error("Object validation failed: {0}")]
    Validation(#[source] BackendError),

    #[error("Failed to close object: {0}")]
    Close(#[source] BackendError),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),
}

impl PoolError {
    pub(crate) fn backend<E>(err: E) -> BackendError
    where
        E: StdError + Send + Sync + 'static,
    {
        Arc::new(err)
    }

    /// Whether retrying the failed operation later may succeed.
    ///
    /// Only waiting for a slot is considered transient; construction errors
    /// are governed by the circuit breaker instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn test_construction_error_keeps_source() {
        let err = PoolError::Construction(PoolError::backend(Refused));

        assert_eq!(err.to_string(), "Failed to create object: connection refused");
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(PoolError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!PoolError::Closed.is_retryable());
        assert!(!PoolError::Cancelled.is_retryable());
    }
}
