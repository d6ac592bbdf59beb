//! llama.cpp engine.
//!
//! Without the `llama` feature this module only provides a stand-in whose
//! `init_runtime` reports `NotSupported`.

use crate::backend::Capabilities;

#[cfg(feature = "llama")]
pub use enabled::LlamaEngine;

#[cfg(not(feature = "llama"))]
pub use disabled::LlamaEngine;

fn llama_capabilities() -> Capabilities {
    Capabilities {
        supports_gpu: cfg!(any(feature = "cuda", feature = "metal")),
        ..Capabilities::default()
    }
}

#[cfg(feature = "llama")]
mod enabled {
    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, Special};
    use llama_cpp_2::sampling::LlamaSampler;
    use llama_cpp_2::token::LlamaToken;
    use std::num::NonZeroU32;
    use std::path::Path;
    use std::sync::{Arc, Mutex, PoisonError, Weak};
    use tracing::debug;

    use super::llama_capabilities;
    use crate::backend::Capabilities;
    use crate::config::BackendConfig;
    use crate::engine::{DecodeSession, InferenceEngine, LoadedModel, SamplingParams, TokenId};
    use crate::error::BackendError;

    /// Maximum tokens per decode batch.
    const BATCH_SIZE: usize = 512;

    /// llama.cpp allows one backend per process; engines share it while any
    /// of them holds a reference.
    static RUNTIME: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());

    fn acquire_runtime() -> Result<Arc<LlamaBackend>, BackendError> {
        let mut slot = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = slot.upgrade() {
            return Ok(runtime);
        }

        let backend = LlamaBackend::init()
            .map_err(|e| BackendError::NotInitialized(format!("llama.cpp backend: {}", e)))?;
        let runtime = Arc::new(backend);
        *slot = Arc::downgrade(&runtime);
        Ok(runtime)
    }

    #[derive(Default)]
    pub struct LlamaEngine {
        runtime: Option<Arc<LlamaBackend>>,
    }

    impl LlamaEngine {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl InferenceEngine for LlamaEngine {
        fn capabilities(&self) -> Capabilities {
            llama_capabilities()
        }

        fn init_runtime(&mut self, _config: &BackendConfig) -> Result<(), BackendError> {
            self.runtime = Some(acquire_runtime()?);
            Ok(())
        }

        fn load(
            &mut self,
            path: &Path,
            config: &BackendConfig,
        ) -> Result<Box<dyn LoadedModel>, BackendError> {
            let runtime = self.runtime.clone().ok_or_else(|| {
                BackendError::NotInitialized("llama.cpp runtime not initialized".to_string())
            })?;

            let params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
            let model = LlamaModel::load_from_file(&runtime, path, &params)
                .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

            let loaded = LlamaLoaded { runtime, model };
            // The configured context must fit before the model counts as loaded.
            drop(loaded.new_context(config.context_length, config.threads)?);
            debug!("Loaded {:?} with context {}", path, config.context_length);

            Ok(Box::new(loaded))
        }

        fn release_runtime(&mut self) {
            self.runtime = None;
        }
    }

    struct LlamaLoaded {
        runtime: Arc<LlamaBackend>,
        model: LlamaModel,
    }

    impl LlamaLoaded {
        fn new_context(&self, n_ctx: u32, threads: u32) -> Result<LlamaContext<'_>, BackendError> {
            let threads = threads as i32;
            let params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(n_ctx))
                .with_n_threads(threads)
                .with_n_threads_batch(threads);

            self.model
                .new_context(&self.runtime, params)
                .map_err(|e| {
                    BackendError::OutOfMemory(format!("context of {} tokens: {}", n_ctx, e))
                })
        }
    }

    impl LoadedModel for LlamaLoaded {
        fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
            let tokens = self
                .model
                .str_to_token(text, AddBos::Always)
                .map_err(|e| BackendError::Tokenization(e.to_string()))?;
            Ok(tokens.into_iter().map(|t| t.0).collect())
        }

        fn is_end_of_generation(&self, token: TokenId) -> bool {
            self.model.is_eog_token(LlamaToken(token))
        }

        fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
            self.model
                .token_to_bytes(LlamaToken(token), Special::Tokenize)
                .map_err(|e| BackendError::Decode(format!("token {}: {}", token, e)))
        }

        fn start_session(
            &self,
            params: &SamplingParams,
        ) -> Result<Box<dyn DecodeSession + '_>, BackendError> {
            let ctx = self.new_context(params.context_length, params.threads)?;
            let sampler = LlamaSampler::chain_simple([
                LlamaSampler::temp(params.temperature),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::dist(params.seed),
            ]);

            Ok(Box::new(LlamaSession {
                ctx,
                sampler,
                position: 0,
                logits_index: None,
            }))
        }
    }

    struct LlamaSession<'a> {
        ctx: LlamaContext<'a>,
        sampler: LlamaSampler,
        position: i32,
        /// Batch index holding the logits of the last decoded token.
        logits_index: Option<i32>,
    }

    impl DecodeSession for LlamaSession<'_> {
        fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
            let last = tokens.len().saturating_sub(1);

            for (n, chunk) in tokens.chunks(BATCH_SIZE).enumerate() {
                let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
                for (j, &token) in chunk.iter().enumerate() {
                    let is_last = n * BATCH_SIZE + j == last;
                    batch
                        .add(LlamaToken(token), self.position + j as i32, &[0], is_last)
                        .map_err(|e| BackendError::Decode(e.to_string()))?;
                }
                self.ctx
                    .decode(&mut batch)
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                self.position += chunk.len() as i32;
                self.logits_index = Some(batch.n_tokens() - 1);
            }
            Ok(())
        }

        fn sample(&mut self) -> Result<TokenId, BackendError> {
            let index = self
                .logits_index
                .ok_or_else(|| BackendError::Decode("sample before decode".to_string()))?;
            let token = self.sampler.sample(&self.ctx, index);
            self.sampler.accept(token);
            Ok(token.0)
        }
    }
}

#[cfg(not(feature = "llama"))]
mod disabled {
    use std::path::Path;

    use super::llama_capabilities;
    use crate::backend::Capabilities;
    use crate::config::BackendConfig;
    use crate::engine::{InferenceEngine, LoadedModel};
    use crate::error::BackendError;

    fn not_compiled() -> BackendError {
        BackendError::NotSupported(
            "llama.cpp engine not compiled in; enable the `llama` feature".to_string(),
        )
    }

    #[derive(Debug, Default)]
    pub struct LlamaEngine;

    impl LlamaEngine {
        pub fn new() -> Self {
            Self
        }
    }

    impl InferenceEngine for LlamaEngine {
        fn capabilities(&self) -> Capabilities {
            llama_capabilities()
        }

        fn init_runtime(&mut self, _config: &BackendConfig) -> Result<(), BackendError> {
            Err(not_compiled())
        }

        fn load(
            &mut self,
            _path: &Path,
            _config: &BackendConfig,
        ) -> Result<Box<dyn LoadedModel>, BackendError> {
            Err(not_compiled())
        }

        fn release_runtime(&mut self) {}
    }
}
