//! Error types for backend operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by backend lifecycle and generation calls.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call needs a lifecycle step that has not happened yet.
    #[error("Backend not ready: {0}")]
    NotInitialized(String),

    /// The engine was not compiled into this build.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}
