//! Generic backend over an [`InferenceEngine`]: lifecycle state machine and
//! the tokenize → decode → sample loop.

use encoding_rs::{Decoder, UTF_8};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKind, BackendState, Capabilities};
use crate::config::BackendConfig;
use crate::engine::{InferenceEngine, LoadedModel, SamplingParams};
use crate::error::BackendError;
use crate::stats::PerformanceStats;

/// Upper bound on the response text in bytes.
pub const MAX_RESPONSE_BYTES: usize = 4096;

/// Confidence reported for local generation.
pub const LOCAL_CONFIDENCE: f32 = 0.9;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model emitted an end-of-generation token.
    Stop,
    /// The token budget ran out first.
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `generate` call. Owns its text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResponse {
    pub text: String,
    /// Tokens generated, excluding the prompt and the end marker.
    pub token_count: u32,
    pub prompt_tokens: u32,
    pub processing_time_ms: u64,
    pub confidence: f32,
    pub truncated: bool,
    pub finish_reason: FinishReason,
    pub language_code: String,
}

/// Backend driving any [`InferenceEngine`].
pub struct EngineBackend<E: InferenceEngine> {
    kind: BackendKind,
    engine: E,
    state: BackendState,
    config: Option<BackendConfig>,
    model: Option<Box<dyn LoadedModel>>,
    model_path: Option<PathBuf>,
    stats: PerformanceStats,
}

impl<E: InferenceEngine> EngineBackend<E> {
    pub fn new(kind: BackendKind, engine: E) -> Self {
        Self {
            kind,
            engine,
            state: BackendState::Uninitialized,
            config: None,
            model: None,
            model_path: None,
            stats: PerformanceStats::default(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn release_model(&mut self) {
        if self.model.take().is_some() {
            debug!("Released model {:?}", self.model_path);
        }
        self.model_path = None;
    }
}

struct Generated {
    text: String,
    tokens: u32,
    prompt_tokens: u32,
    finish_reason: FinishReason,
}

fn run_generation(
    model: &dyn LoadedModel,
    config: &BackendConfig,
    prompt: &str,
) -> Result<Generated, BackendError> {
    let prompt_tokens = model.tokenize(prompt)?;
    if prompt_tokens.is_empty() {
        return Err(BackendError::Tokenization(
            "prompt produced no tokens".to_string(),
        ));
    }

    let context = config.context_length as usize;
    if prompt_tokens.len() >= context {
        return Err(BackendError::InvalidArgument(format!(
            "prompt is {} tokens, context window is {}",
            prompt_tokens.len(),
            context
        )));
    }
    let budget = (config.max_tokens as usize).min(context - prompt_tokens.len());

    let params = SamplingParams::from_config(config, config.seed.unwrap_or_else(clock_seed));
    let mut session = model.start_session(&params)?;
    session.decode(&prompt_tokens)?;

    let mut decoder = UTF_8.new_decoder_without_bom_handling();
    let mut text = String::new();
    let mut generated = 0u32;
    let mut finish_reason = FinishReason::Length;
    let mut dropped = 0usize;

    for step in 0..budget {
        let token = session.sample()?;
        if model.is_end_of_generation(token) {
            finish_reason = FinishReason::Stop;
            break;
        }
        generated += 1;

        let piece = decode_piece(&mut decoder, &model.token_to_bytes(token)?);
        if text.len() + piece.len() <= MAX_RESPONSE_BYTES {
            text.push_str(&piece);
        } else {
            dropped += piece.len();
        }

        if step + 1 < budget {
            session.decode(&[token])?;
        }
    }

    if dropped > 0 {
        warn!(
            "Response exceeded {} bytes, dropped {} bytes",
            MAX_RESPONSE_BYTES, dropped
        );
    }

    Ok(Generated {
        text,
        tokens: generated,
        prompt_tokens: prompt_tokens.len() as u32,
        finish_reason,
    })
}

/// Decode the next bytes of the output stream. Bytes of a character split
/// across tokens are held by `decoder` until the rest arrives; an incomplete
/// character at the end of generation is dropped.
fn decode_piece(decoder: &mut Decoder, bytes: &[u8]) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len() * 3 + 4);
    let mut piece = String::with_capacity(capacity);
    let _ = decoder.decode_to_string(bytes, &mut piece, false);
    piece
}

fn clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0)
}

impl<E: InferenceEngine> Backend for EngineBackend<E> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn init(&mut self, config: BackendConfig) -> Result<(), BackendError> {
        if self.state != BackendState::Uninitialized {
            debug!("Re-initializing {} backend", self.kind);
            self.cleanup();
        }

        let config = config.normalized();
        self.engine.init_runtime(&config)?;
        info!(
            "Initialized {} backend (context {}, gpu layers {})",
            self.kind, config.context_length, config.gpu_layers
        );
        self.config = Some(config);
        self.state = BackendState::Initialized;
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> Result<(), BackendError> {
        let config = match (self.state, &self.config) {
            (BackendState::Uninitialized, _) | (_, None) => {
                return Err(BackendError::NotInitialized(
                    "call init before load_model".to_string(),
                ))
            }
            (_, Some(config)) => config.clone(),
        };

        if self.model.is_some() {
            self.release_model();
            self.state = BackendState::Initialized;
        }

        if !path.is_file() {
            return Err(BackendError::ModelNotFound(path.to_path_buf()));
        }

        info!("Loading model from {:?}", path);
        let model = self.engine.load(path, &config)?;
        self.model = Some(model);
        self.model_path = Some(path.to_path_buf());
        self.state = BackendState::Loaded;
        Ok(())
    }

    fn generate(
        &mut self,
        prompt: &str,
        language: Option<&str>,
    ) -> Result<GenerationResponse, BackendError> {
        if self.state != BackendState::Loaded {
            return Err(BackendError::NotInitialized(
                "no model loaded".to_string(),
            ));
        }
        if prompt.trim().is_empty() {
            return Err(BackendError::InvalidArgument("prompt is empty".to_string()));
        }
        let (Some(model), Some(config)) = (&self.model, &self.config) else {
            return Err(BackendError::NotInitialized(
                "no model loaded".to_string(),
            ));
        };

        let language_code = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(config.language.as_str())
            .to_string();

        self.state = BackendState::Generating;
        let start = Instant::now();
        let result = run_generation(model.as_ref(), config, prompt);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.state = BackendState::Loaded;
        let generated = result?;

        self.stats.record(elapsed_ms, generated.tokens);
        info!(
            "Generated {} tokens in {} ms ({})",
            generated.tokens, elapsed_ms, generated.finish_reason
        );

        Ok(GenerationResponse {
            text: generated.text,
            token_count: generated.tokens,
            prompt_tokens: generated.prompt_tokens,
            processing_time_ms: elapsed_ms,
            confidence: LOCAL_CONFIDENCE,
            truncated: generated.finish_reason == FinishReason::Length,
            finish_reason: generated.finish_reason,
            language_code,
        })
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = self.engine.capabilities();
        if let Some(config) = &self.config {
            caps.max_context_length = config.context_length;
        }
        caps
    }

    fn unload_model(&mut self) -> Result<(), BackendError> {
        match self.state {
            BackendState::Uninitialized => Err(BackendError::NotInitialized(
                "backend is not initialized".to_string(),
            )),
            _ => {
                self.release_model();
                self.state = BackendState::Initialized;
                Ok(())
            }
        }
    }

    fn cleanup(&mut self) {
        if self.state == BackendState::Uninitialized {
            return;
        }
        self.release_model();
        self.engine.release_runtime();
        self.config = None;
        self.state = BackendState::Uninitialized;
        info!("Cleaned up {} backend", self.kind);
    }

    fn stats(&self) -> &PerformanceStats {
        &self.stats
    }

    fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    fn config(&self) -> Option<&BackendConfig> {
        self.config.as_ref()
    }
}

impl<E: InferenceEngine> Drop for EngineBackend<E> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn model_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("tiny.gguf");
        std::fs::write(&path, b"GGUF").unwrap();
        path
    }

    fn ready(
        engine: MockEngine,
        config: BackendConfig,
        dir: &tempfile::TempDir,
    ) -> EngineBackend<MockEngine> {
        let mut backend = EngineBackend::new(BackendKind::Llama, engine);
        backend.init(config).unwrap();
        backend.load_model(&model_file(dir)).unwrap();
        backend
    }

    #[test]
    fn test_generate_before_load_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = EngineBackend::new(BackendKind::Llama, MockEngine::new(["a"]));

        let err = backend.generate("hello", Some("en")).unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized(_)));

        backend.init(BackendConfig::default()).unwrap();
        let err = backend.generate("hello", Some("en")).unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized(_)));
        assert_eq!(backend.stats().generations, 0);

        let err = EngineBackend::new(BackendKind::Llama, MockEngine::new(["a"]))
            .load_model(&model_file(&dir))
            .unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized(_)));
    }

    #[test]
    fn test_stops_at_end_of_generation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["Hel", "lo", "!"]).stop_after(3);
        let mut backend = ready(engine, BackendConfig::default(), &dir);

        let response = backend.generate("say hello", None).unwrap();

        assert_eq!(response.text, "Hello!");
        assert_eq!(response.token_count, 3);
        assert_eq!(response.prompt_tokens, 2);
        assert!(!response.truncated);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.finish_reason.to_string(), "stop");
        assert_eq!(response.confidence, LOCAL_CONFIDENCE);
        assert_eq!(response.language_code, "en");
        assert_eq!(backend.state(), BackendState::Loaded);
    }

    #[test]
    fn test_token_budget_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["x"]);
        let counters = engine.counters();
        let config = BackendConfig::builder().max_tokens(5).build();
        let mut backend = ready(engine, config, &dir);

        let response = backend.generate("go", Some("fr")).unwrap();

        assert_eq!(response.token_count, 5);
        assert_eq!(response.text, "xxxxx");
        assert!(response.truncated);
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.language_code, "fr");

        // Prompt decode plus one feedback decode per token except the last.
        let counters = counters.lock().unwrap();
        assert_eq!(counters.decode_calls, 5);
        assert_eq!(counters.decoded_tokens, 1 + 4);
    }

    #[test]
    fn test_character_split_across_tokens() {
        let dir = tempfile::tempdir().unwrap();
        // "é" is 0xC3 0xA9 and arrives as two byte-fallback tokens.
        let engine = MockEngine::new([b"caf".to_vec(), vec![0xC3], vec![0xA9], b"!".to_vec()])
            .stop_after(4);
        let mut backend = ready(engine, BackendConfig::default(), &dir);

        let response = backend.generate("order coffee", Some("fr")).unwrap();

        assert_eq!(response.text, "café!");
        assert_eq!(response.token_count, 4);
    }

    #[test]
    fn test_context_window_bounds_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::builder()
            .context_length(8)
            .max_tokens(100)
            .build();
        let mut backend = ready(MockEngine::new(["y"]), config, &dir);

        let response = backend.generate("one two three", None).unwrap();
        assert_eq!(response.token_count, 5);
        assert!(response.truncated);

        let err = backend.generate("a b c d e f g h", None).unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }

    #[test]
    fn test_response_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let piece = "z".repeat(1000);
        let config = BackendConfig::builder().max_tokens(10).build();
        let mut backend = ready(MockEngine::new([piece]), config, &dir);

        let response = backend.generate("long", None).unwrap();

        assert_eq!(response.token_count, 10);
        assert_eq!(response.text.len(), 4000);
        assert!(response.text.len() <= MAX_RESPONSE_BYTES);
    }

    #[test]
    fn test_decode_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]).failing_decode_at(2);
        let mut backend = ready(engine, BackendConfig::default(), &dir);

        let err = backend.generate("hi", None).unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
        assert_eq!(backend.state(), BackendState::Loaded);
        assert_eq!(backend.stats().generations, 0);
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = ready(MockEngine::new(["a"]), BackendConfig::default(), &dir);
        let err = backend.generate("   ", None).unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }

    #[test]
    fn test_failed_load_leaves_backend_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]).failing_load();
        let mut backend = EngineBackend::new(BackendKind::Llama, engine);
        backend.init(BackendConfig::default()).unwrap();

        let err = backend.load_model(&model_file(&dir)).unwrap_err();
        assert!(matches!(err, BackendError::ModelLoad(_)));
        assert_eq!(backend.state(), BackendState::Initialized);
        assert!(backend.model_path().is_none());

        let err = backend.load_model(&dir.path().join("missing.gguf")).unwrap_err();
        assert!(matches!(err, BackendError::ModelNotFound(_)));
        assert_eq!(backend.state(), BackendState::Initialized);
    }

    #[test]
    fn test_reload_replaces_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]);
        let counters = engine.counters();
        let mut backend = ready(engine, BackendConfig::default(), &dir);

        let other = dir.path().join("other.gguf");
        std::fs::write(&other, b"GGUF").unwrap();
        backend.load_model(&other).unwrap();

        assert_eq!(backend.model_path(), Some(other.as_path()));
        let counters = counters.lock().unwrap();
        assert_eq!(counters.loads, 2);
        assert_eq!(counters.live_models, 1);
    }

    #[test]
    fn test_unload_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]);
        let counters = engine.counters();
        let mut backend = ready(engine, BackendConfig::default(), &dir);

        backend.unload_model().unwrap();
        assert_eq!(backend.state(), BackendState::Initialized);
        assert!(backend.model_path().is_none());
        assert_eq!(counters.lock().unwrap().live_models, 0);

        backend.cleanup();
        backend.cleanup();
        assert_eq!(backend.state(), BackendState::Uninitialized);
        assert!(backend.config().is_none());
        assert_eq!(counters.lock().unwrap().releases, 1);

        let err = backend.unload_model().unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized(_)));
    }

    #[test]
    fn test_cleanup_from_loaded_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]);
        let counters = engine.counters();
        let backend = ready(engine, BackendConfig::default(), &dir);

        drop(backend);

        let counters = counters.lock().unwrap();
        assert_eq!(counters.live_models, 0);
        assert_eq!(counters.releases, 1);
    }

    #[test]
    fn test_stats_and_seed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(["a"]).stop_after(2);
        let counters = engine.counters();
        let config = BackendConfig::builder().seed(7).build();
        let mut backend = ready(engine, config, &dir);

        backend.generate("one", None).unwrap();
        backend.generate("two", None).unwrap();

        let stats = backend.stats();
        assert_eq!(stats.generations, 2);
        assert_eq!(stats.total_tokens, 4);
        assert!(stats.min_time_ms.is_some());
        assert!(stats.max_time_ms >= stats.min_time_ms.unwrap());
        assert_eq!(counters.lock().unwrap().last_seed, Some(7));
    }

    #[test]
    fn test_capabilities_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::builder().context_length(4096).build();
        let backend = ready(MockEngine::new(["a"]), config, &dir);

        let caps = backend.capabilities();
        assert_eq!(caps.max_context_length, 4096);
        assert_eq!(caps.recommended_context_length, 2048);
        assert_eq!(caps.max_batch_size, 512);
        assert!(!caps.supports_streaming);
    }
}
