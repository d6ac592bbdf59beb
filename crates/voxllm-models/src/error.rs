//! Error types for model management operations.

use thiserror::Error;

use crate::manager::ModelStatus;

/// Errors that can occur while resolving, downloading or verifying models.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A required field was empty or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure that survived every retry, or a non-retryable HTTP status.
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client could not be constructed or a request could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Downloaded bytes do not hash to the catalog checksum.
    #[error("Model checksum mismatch. Expected: {expected}, got: {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Admission check failed before any byte was transferred.
    #[error("Insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    /// The model is not in a usable state.
    #[error("Model '{name}' is not available (status: {status})")]
    NotAvailable { name: String, status: ModelStatus },

    /// Another call on this manager is already downloading the model.
    #[error("Model '{0}' is already being downloaded")]
    DownloadInProgress(String),

    /// Local read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Staging sidecar could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Whether the error comes from the network layer.
    pub fn is_network(&self) -> bool {
        matches!(self, ModelError::Network(_) | ModelError::Http(_))
    }
}
