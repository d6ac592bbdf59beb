//! Backend interface and lifecycle types.

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::config::{BackendConfig, DEFAULT_CONTEXT_LENGTH};
use crate::error::BackendError;
use crate::generation::{EngineBackend, GenerationResponse};
use crate::llama::LlamaEngine;
use crate::stats::PerformanceStats;

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    Loaded,
    /// Only observable while a `generate` call is running.
    Generating,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Uninitialized => "uninitialized",
            BackendState::Initialized => "initialized",
            BackendState::Loaded => "loaded",
            BackendState::Generating => "generating",
        };
        f.write_str(s)
    }
}

/// Inference engines a backend can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendKind {
    Llama,
    /// The llama.cpp engine tuned for small chat models.
    TinyLlama,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Llama, BackendKind::TinyLlama];

    /// Whether the engine behind this kind is part of the build.
    pub fn is_compiled_in(&self) -> bool {
        match self {
            BackendKind::Llama | BackendKind::TinyLlama => cfg!(feature = "llama"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Llama => "llama.cpp",
            BackendKind::TinyLlama => "tinyllama",
        };
        f.write_str(s)
    }
}

/// What a backend type supports. Static per type, not per loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub model_format: &'static str,
    pub supports_streaming: bool,
    pub supports_gpu: bool,
    pub supports_quantization: bool,
    pub supports_context_caching: bool,
    pub max_context_length: u32,
    pub recommended_context_length: u32,
    pub max_batch_size: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            model_format: "GGUF",
            supports_streaming: false,
            supports_gpu: false,
            supports_quantization: true,
            supports_context_caching: false,
            max_context_length: DEFAULT_CONTEXT_LENGTH,
            recommended_context_length: DEFAULT_CONTEXT_LENGTH,
            max_batch_size: 512,
        }
    }
}

/// An inference backend.
///
/// Calls must follow the lifecycle
/// `init → load_model → generate* → unload_model → cleanup`; `cleanup` is
/// valid from any state and may be repeated.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn state(&self) -> BackendState;

    /// Allocate the runtime. Re-initializing discards any loaded model.
    fn init(&mut self, config: BackendConfig) -> Result<(), BackendError>;

    /// Load a model file, replacing any model already loaded. On failure
    /// the backend is left `Initialized`.
    fn load_model(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Generate a completion for `prompt`.
    fn generate(
        &mut self,
        prompt: &str,
        language: Option<&str>,
    ) -> Result<GenerationResponse, BackendError>;

    fn capabilities(&self) -> Capabilities;

    /// Drop the loaded model. A no-op when nothing is loaded.
    fn unload_model(&mut self) -> Result<(), BackendError>;

    /// Release everything including the runtime.
    fn cleanup(&mut self);

    fn stats(&self) -> &PerformanceStats;

    /// Path of the loaded model, if any.
    fn model_path(&self) -> Option<&Path>;

    /// Configuration in effect after `init`.
    fn config(&self) -> Option<&BackendConfig>;

    fn is_loaded(&self) -> bool {
        self.state() == BackendState::Loaded
    }
}

/// Create an uninitialized backend of the given kind.
///
/// Engines missing from the build are still constructed; their `init`
/// reports `NotSupported`.
pub fn create_backend(kind: BackendKind) -> Box<dyn Backend> {
    Box::new(EngineBackend::new(kind, LlamaEngine::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(BackendKind::Llama.to_string(), "llama.cpp");
        assert_eq!(BackendKind::TinyLlama.to_string(), "tinyllama");
    }

    #[test]
    fn test_compiled_in_follows_feature() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.is_compiled_in(), cfg!(feature = "llama"));
        }
    }

    #[test]
    fn test_create_backend_starts_uninitialized() {
        let backend = create_backend(BackendKind::TinyLlama);
        assert_eq!(backend.kind(), BackendKind::TinyLlama);
        assert_eq!(backend.state(), BackendState::Uninitialized);
        assert!(!backend.is_loaded());
        assert!(backend.model_path().is_none());
        assert_eq!(backend.capabilities().recommended_context_length, 2048);
    }

    #[cfg(not(feature = "llama"))]
    #[test]
    fn test_init_without_engine_is_not_supported() {
        let mut backend = create_backend(BackendKind::Llama);
        let err = backend.init(BackendConfig::default()).unwrap_err();
        assert!(matches!(err, BackendError::NotSupported(_)));
        assert_eq!(backend.state(), BackendState::Uninitialized);
    }
}
