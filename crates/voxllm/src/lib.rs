//! VoxLLM: offline model acquisition and local inference.
//!
//! This crate ties the two halves together:
//! 1. [`ModelManager`] resolves a catalog entry to a verified local file,
//!    downloading it when needed.
//! 2. A [`Backend`] loads that file and generates text from it.
//!
//! [`prepare_model`] runs the whole hand-off for a voice pipeline.

use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

pub use voxllm_backend::{
    create_backend, Backend, BackendConfig, BackendError, BackendKind, BackendState,
    Capabilities, FinishReason, GenerationResponse, PerformanceStats,
};
pub use voxllm_models::{
    progress_bar, registry, DownloadProgress, ModelDescriptor, ModelError, ModelFormat,
    ModelManager, ModelManagerConfig, ModelStatus, ModelUsage, ProgressCallback,
};

pub use voxllm_backend as backend;
pub use voxllm_models as models;

/// Closed classification of every failure the crate can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    /// A prerequisite step (init, load, download) has not happened.
    NotInitialized,
    /// The inference engine is not part of this build.
    NotSupported,
    Network,
    ChecksumMismatch,
    InsufficientSpace,
    FileIo,
    /// The same model is already being downloaded.
    Busy,
    /// The engine failed while loading, tokenizing or decoding.
    Inference,
}

/// Any error from model management or inference.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Model(e) => match e {
                ModelError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                ModelError::Network(_) | ModelError::Http(_) => ErrorKind::Network,
                ModelError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
                ModelError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
                ModelError::NotAvailable { .. } => ErrorKind::NotInitialized,
                ModelError::DownloadInProgress(_) => ErrorKind::Busy,
                ModelError::Io(_) | ModelError::Json(_) => ErrorKind::FileIo,
            },
            Error::Backend(e) => match e {
                BackendError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                BackendError::NotInitialized(_) => ErrorKind::NotInitialized,
                BackendError::NotSupported(_) => ErrorKind::NotSupported,
                BackendError::OutOfMemory(_) => ErrorKind::OutOfMemory,
                BackendError::ModelNotFound(_) => ErrorKind::FileIo,
                BackendError::ModelLoad(_)
                | BackendError::Tokenization(_)
                | BackendError::Decode(_) => ErrorKind::Inference,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Make `descriptor` available and load it into `backend`.
///
/// The backend must already be initialized. Returns the loaded model path.
pub async fn prepare_model(
    manager: &ModelManager,
    descriptor: &ModelDescriptor,
    backend: &mut dyn Backend,
) -> Result<PathBuf> {
    manager.ensure_available(descriptor).await?;
    let path = manager.get_path(descriptor)?;
    backend.load_model(&path)?;

    info!(
        "Model '{}' ready on {} backend",
        descriptor.name,
        backend.kind()
    );
    Ok(path)
}
