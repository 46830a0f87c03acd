//! Error types for pipeline construction and administration

use thiserror::Error;

use tessera_core::StorageError;

/// Errors raised while building, configuring or administering a pipeline
///
/// The ingestion path never returns these; it absorbs failures into the
/// fallback store or the diagnostic sink.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration value could not be parsed
    #[error("Invalid configuration {key}={value}: {reason}")]
    InvalidConfig {
        key: String,
        value: String,
        reason: String,
    },

    /// Storage could not be opened or administered
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Background worker could not be started
    #[error("Failed to start batch worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A global subscriber is already installed
    #[error("Subscriber initialization failed: {0}")]
    Subscriber(String),
}

impl PipelineError {
    pub fn invalid_config(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
