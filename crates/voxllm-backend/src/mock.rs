//! Scripted inference engine for tests.
//!
//! Prompts tokenize one token per whitespace-separated word. Sampling
//! replays a fixed list of byte pieces, optionally followed by the
//! end-of-generation token.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::Capabilities;
use crate::config::BackendConfig;
use crate::engine::{DecodeSession, InferenceEngine, LoadedModel, SamplingParams, TokenId};
use crate::error::BackendError;

/// End-of-generation token of the mock vocabulary.
pub const MOCK_EOG: TokenId = 2;

const FIRST_PIECE: TokenId = 100;

/// What the engine has been asked to do so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub inits: usize,
    pub releases: usize,
    pub loads: usize,
    pub sessions: usize,
    pub decode_calls: usize,
    pub decoded_tokens: usize,
    pub live_models: usize,
    pub last_seed: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MockEngine {
    pieces: Vec<Vec<u8>>,
    stop_after: Option<usize>,
    fail_load: bool,
    fail_decode_at: Option<usize>,
    counters: Arc<Mutex<MockCounters>>,
}

impl MockEngine {
    /// Engine that emits `pieces` in order and then keeps cycling them.
    pub fn new<S: Into<Vec<u8>>>(pieces: impl IntoIterator<Item = S>) -> Self {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            stop_after: None,
            fail_load: false,
            fail_decode_at: None,
            counters: Arc::default(),
        }
    }

    /// Emit the end-of-generation token after `tokens` pieces.
    pub fn stop_after(mut self, tokens: usize) -> Self {
        self.stop_after = Some(tokens);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Fail the `call`-th decode of a session, counting the prompt decode as 0.
    pub fn failing_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    /// Shared view of the counters; stays valid after the engine moves.
    pub fn counters(&self) -> Arc<Mutex<MockCounters>> {
        Arc::clone(&self.counters)
    }
}

fn bump(counters: &Mutex<MockCounters>, f: impl FnOnce(&mut MockCounters)) {
    f(&mut counters.lock().unwrap_or_else(PoisonError::into_inner))
}

impl InferenceEngine for MockEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn init_runtime(&mut self, _config: &BackendConfig) -> Result<(), BackendError> {
        bump(&self.counters, |c| c.inits += 1);
        Ok(())
    }

    fn load(
        &mut self,
        _path: &Path,
        _config: &BackendConfig,
    ) -> Result<Box<dyn LoadedModel>, BackendError> {
        if self.fail_load {
            return Err(BackendError::ModelLoad("mock load failure".to_string()));
        }
        bump(&self.counters, |c| {
            c.loads += 1;
            c.live_models += 1;
        });
        Ok(Box::new(MockModel {
            engine: self.clone(),
        }))
    }

    fn release_runtime(&mut self) {
        bump(&self.counters, |c| c.releases += 1);
    }
}

struct MockModel {
    engine: MockEngine,
}

impl Drop for MockModel {
    fn drop(&mut self) {
        bump(&self.engine.counters, |c| c.live_models -= 1);
    }
}

impl LoadedModel for MockModel {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        Ok((0..text.split_whitespace().count())
            .map(|i| 10 + i as TokenId)
            .collect())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == MOCK_EOG
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        let index = (token - FIRST_PIECE) as usize;
        self.engine
            .pieces
            .get(index % self.engine.pieces.len().max(1))
            .cloned()
            .ok_or_else(|| BackendError::Decode(format!("unknown token {}", token)))
    }

    fn start_session(
        &self,
        params: &SamplingParams,
    ) -> Result<Box<dyn DecodeSession + '_>, BackendError> {
        bump(&self.engine.counters, |c| {
            c.sessions += 1;
            c.last_seed = Some(params.seed);
        });
        Ok(Box::new(MockSession {
            engine: &self.engine,
            decodes: 0,
            sampled: 0,
        }))
    }
}

struct MockSession<'a> {
    engine: &'a MockEngine,
    decodes: usize,
    sampled: usize,
}

impl DecodeSession for MockSession<'_> {
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        let call = self.decodes;
        self.decodes += 1;
        if self.engine.fail_decode_at == Some(call) {
            return Err(BackendError::Decode(format!("mock decode failure at call {}", call)));
        }
        bump(&self.engine.counters, |c| {
            c.decode_calls += 1;
            c.decoded_tokens += tokens.len();
        });
        Ok(())
    }

    fn sample(&mut self) -> Result<TokenId, BackendError> {
        if self.decodes == 0 {
            return Err(BackendError::Decode("sample before decode".to_string()));
        }
        if self.stop_reached() {
            return Ok(MOCK_EOG);
        }
        let token = FIRST_PIECE + self.sampled as TokenId;
        self.sampled += 1;
        Ok(token)
    }
}

impl MockSession<'_> {
    fn stop_reached(&self) -> bool {
        self.engine.stop_after == Some(self.sampled)
    }
}
