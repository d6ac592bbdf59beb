//! Backend configuration.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_THREADS: u32 = 4;

/// Configuration copied into a backend at `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Context window in tokens (prompt plus generated text).
    pub context_length: u32,
    /// Upper bound on generated tokens per call.
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Layers offloaded to the GPU; 0 keeps everything on the CPU.
    pub gpu_layers: u32,
    /// Language code echoed when a request carries no hint.
    pub language: String,
    /// Sampling seed; `None` derives one from the clock.
    pub seed: Option<u32>,
    pub threads: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            context_length: DEFAULT_CONTEXT_LENGTH,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            gpu_layers: 0,
            language: DEFAULT_LANGUAGE.to_string(),
            seed: None,
            threads: DEFAULT_THREADS,
        }
    }
}

impl BackendConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            context_length: env_parse("VOXLLM_CONTEXT_LENGTH").unwrap_or(defaults.context_length),
            max_tokens: env_parse("VOXLLM_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            temperature: env_parse("VOXLLM_TEMPERATURE").unwrap_or(defaults.temperature),
            top_p: env_parse("VOXLLM_TOP_P").unwrap_or(defaults.top_p),
            gpu_layers: env_parse("VOXLLM_GPU_LAYERS").unwrap_or(defaults.gpu_layers),
            language: std::env::var("VOXLLM_LANGUAGE").unwrap_or(defaults.language),
            seed: env_parse("VOXLLM_SEED").or(defaults.seed),
            threads: defaults.threads,
        }
        .normalized()
    }

    /// Create a builder for configuration.
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::default()
    }

    /// Replace unset or out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.context_length == 0 {
            self.context_length = DEFAULT_CONTEXT_LENGTH;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        // Zero is greedy decoding.
        if !(self.temperature >= 0.0) {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            self.top_p = DEFAULT_TOP_P;
        }
        if self.language.trim().is_empty() {
            self.language = DEFAULT_LANGUAGE.to_string();
        }
        if self.threads == 0 {
            self.threads = DEFAULT_THREADS;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Builder for backend configuration.
#[derive(Debug, Default)]
pub struct BackendConfigBuilder {
    config: BackendConfig,
}

impl BackendConfigBuilder {
    pub fn context_length(mut self, tokens: u32) -> Self {
        self.config.context_length = tokens;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.config.top_p = top_p;
        self
    }

    pub fn gpu_layers(mut self, layers: u32) -> Self {
        self.config.gpu_layers = layers;
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.config.language = language.into();
        self
    }

    pub fn seed(mut self, seed: u32) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.config.threads = threads;
        self
    }

    pub fn build(self) -> BackendConfig {
        self.config.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.context_length, 2048);
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 0.9);
        assert_eq!(config.gpu_layers, 0);
        assert_eq!(config.language, "en");
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_builder_normalizes() {
        let config = BackendConfig::builder()
            .context_length(0)
            .max_tokens(0)
            .temperature(-1.0)
            .top_p(1.5)
            .language("")
            .seed(42)
            .build();

        assert_eq!(config.context_length, DEFAULT_CONTEXT_LENGTH);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.top_p, DEFAULT_TOP_P);
        assert_eq!(config.language, "en");
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_builder_keeps_valid_values() {
        let config = BackendConfig::builder()
            .context_length(512)
            .max_tokens(16)
            .temperature(0.2)
            .top_p(1.0)
            .gpu_layers(33)
            .language("de")
            .threads(8)
            .build();

        assert_eq!(config.context_length, 512);
        assert_eq!(config.max_tokens, 16);
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.gpu_layers, 33);
        assert_eq!(config.language, "de");
        assert_eq!(config.threads, 8);
    }

    #[test]
    fn test_zero_temperature_is_kept() {
        let config = BackendConfig::builder().temperature(0.0).build();
        assert_eq!(config.temperature, 0.0);

        let config = BackendConfig::builder().temperature(f32::NAN).build();
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
    }
}
