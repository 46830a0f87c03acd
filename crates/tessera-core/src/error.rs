//! Error types for Tessera
//!
//! [`StorageError`] is the error every record sink reports. Its variants
//! encode how the resilience layer should react: transient faults are
//! retried, sustained outages trip the circuit breaker, and serialization
//! faults are never retried.

use thiserror::Error;

/// Errors that can occur while persisting or reading log records
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Retryable fault (connection hiccup, lock contention)
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Sustained outage of the durable store
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Database engine error
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data failed validation
    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Create a new Transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a new Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Whether another attempt at the same write could succeed
    ///
    /// Serialization and corruption are properties of the record itself,
    /// so repeating the write cannot help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_) | Self::Corrupted(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised while building query filters
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid message pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid time window: start {start} is not before end {end}")]
    InvalidWindow { start: String, end: String },
}
