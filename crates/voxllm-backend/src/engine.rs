//! Seams between the generic backend and a concrete inference engine.
//!
//! An engine owns the runtime handle. Loading a model yields a
//! [`LoadedModel`], and each generation opens a fresh [`DecodeSession`]
//! (its evaluation context) on that model.

use std::path::Path;

use crate::backend::Capabilities;
use crate::config::BackendConfig;
use crate::error::BackendError;

/// Vocabulary index produced by tokenization and sampling.
pub type TokenId = i32;

/// Sampling settings for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub context_length: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u32,
    pub threads: u32,
}

impl SamplingParams {
    pub fn from_config(config: &BackendConfig, seed: u32) -> Self {
        Self {
            context_length: config.context_length,
            temperature: config.temperature,
            top_p: config.top_p,
            seed,
            threads: config.threads,
        }
    }
}

pub trait InferenceEngine: Send {
    /// Static capabilities of this engine type.
    fn capabilities(&self) -> Capabilities;

    /// Allocate the runtime. Fails with `NotSupported` when the engine is
    /// not part of this build.
    fn init_runtime(&mut self, config: &BackendConfig) -> Result<(), BackendError>;

    /// Open `path` and validate that a context of the configured size can
    /// be built for it.
    fn load(
        &mut self,
        path: &Path,
        config: &BackendConfig,
    ) -> Result<Box<dyn LoadedModel>, BackendError>;

    /// Release the runtime. Called only after every loaded model is dropped.
    fn release_runtime(&mut self);
}

pub trait LoadedModel: Send {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of `token`. A multi-byte character may be split across
    /// several tokens.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    fn start_session(
        &self,
        params: &SamplingParams,
    ) -> Result<Box<dyn DecodeSession + '_>, BackendError>;
}

/// Evaluation state for one generation.
pub trait DecodeSession {
    /// Evaluate `tokens` at the next positions of the sequence.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Sample the next token from the logits of the last decoded position.
    fn sample(&mut self) -> Result<TokenId, BackendError>;
}
