//! Resilience error types

use std::time::Duration;

use thiserror::Error;

use tessera_core::StorageError;

/// Outcome of a protected write that did not succeed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    /// Every attempt failed
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: StorageError,
    },

    /// The breaker is open; the write was not attempted
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The sink returned an error that retrying cannot fix
    #[error("rejected: {0}")]
    Rejected(StorageError),
}

impl ResilienceError {
    /// Underlying sink error, if the sink was called
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::RetryExhausted { last_error, .. } => Some(last_error),
            Self::Rejected(err) => Some(err),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Whether the sink was never called
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}
