//! Inference backends for VoxLLM.
//!
//! A [`Backend`] loads a model file into an inference runtime and runs a
//! bounded tokenize → decode → sample loop over it. Concrete engines plug
//! in through [`InferenceEngine`]; the llama.cpp engine is compiled in
//! with the `llama` feature.
//!
//! Backends are blocking and meant for one caller at a time.

mod backend;
mod config;
pub mod engine;
mod error;
mod generation;
mod llama;
mod stats;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backend::{create_backend, Backend, BackendKind, BackendState, Capabilities};
pub use config::{BackendConfig, BackendConfigBuilder};
pub use engine::InferenceEngine;
pub use error::BackendError;
pub use generation::{
    EngineBackend, FinishReason, GenerationResponse, LOCAL_CONFIDENCE, MAX_RESPONSE_BYTES,
};
pub use llama::LlamaEngine;
pub use stats::PerformanceStats;
