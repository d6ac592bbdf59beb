//! Model management for VoxLLM.
//!
//! This crate knows which models exist, checks there is room for them,
//! downloads them with resume support, verifies their checksums and
//! resolves their on-disk paths. Verified models live in `models_dir`;
//! partial downloads stay in the staging `cache_dir` until they pass
//! verification. A small usage index next to the models records when each
//! one was last used so stale models can be cleared.

mod config;
mod download;
mod error;
mod manager;
pub mod paths;
mod progress;
pub mod registry;
pub mod storage;
mod usage;
pub mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod test_server;

pub use config::{ModelManagerConfig, ModelManagerConfigBuilder};
pub use error::ModelError;
pub use manager::{ModelManager, ModelStatus};
pub use progress::{progress_bar, DownloadProgress, ProgressCallback};
pub use registry::{ModelDescriptor, ModelFormat};
pub use usage::ModelUsage;
