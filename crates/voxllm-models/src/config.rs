//! Model manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::{default_cache_dir, default_models_dir};
use crate::progress::{DownloadProgress, ProgressCallback};

/// Configuration for the model manager.
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Directory holding verified models.
    pub models_dir: PathBuf,
    /// Staging directory for partial downloads.
    pub cache_dir: PathBuf,
    /// Download missing models in `ensure_available`.
    pub auto_download: bool,
    /// Verify SHA256 checksums when the descriptor carries one.
    pub verify_checksum: bool,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Per-attempt timeout: bounds the wait for headers and for each chunk.
    pub timeout: Duration,
    /// Delay before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
    pub progress: Option<ProgressCallback>,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            cache_dir: default_cache_dir(),
            auto_download: true,
            verify_checksum: true,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(1),
            progress: None,
        }
    }
}

impl ModelManagerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let models_dir = std::env::var("VOXLLM_MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.models_dir);

        let cache_dir = std::env::var("VOXLLM_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let auto_download = env_flag("VOXLLM_AUTO_DOWNLOAD").unwrap_or(defaults.auto_download);
        let verify_checksum =
            env_flag("VOXLLM_VERIFY_CHECKSUM").unwrap_or(defaults.verify_checksum);

        let max_retries = std::env::var("VOXLLM_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries);

        let timeout = std::env::var("VOXLLM_DOWNLOAD_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            models_dir,
            cache_dir,
            auto_download,
            verify_checksum,
            max_retries,
            timeout,
            retry_backoff: defaults.retry_backoff,
            progress: None,
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> ModelManagerConfigBuilder {
        ModelManagerConfigBuilder::default()
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        let v = v.to_lowercase();
        v == "1" || v == "true" || v == "yes"
    })
}

/// Builder for model manager configuration.
#[derive(Debug, Default)]
pub struct ModelManagerConfigBuilder {
    config: ModelManagerConfig,
}

impl ModelManagerConfigBuilder {
    pub fn models_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.models_dir = path.into();
        self
    }

    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = path.into();
        self
    }

    pub fn auto_download(mut self, enabled: bool) -> Self {
        self.config.auto_download = enabled;
        self
    }

    pub fn verify_checksum(mut self, enabled: bool) -> Self {
        self.config.verify_checksum = enabled;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn timeout_seconds(self, seconds: u64) -> Self {
        self.timeout(Duration::from_secs(seconds))
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(&DownloadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.config.progress = Some(ProgressCallback::new(callback));
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.config.progress = Some(callback);
        self
    }

    pub fn build(self) -> ModelManagerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelManagerConfig::default();
        assert!(config.auto_download);
        assert!(config.verify_checksum);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(config.progress.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ModelManagerConfig::builder()
            .models_dir("/data/models")
            .cache_dir("/data/staging")
            .auto_download(false)
            .verify_checksum(false)
            .max_retries(7)
            .timeout_seconds(5)
            .on_progress(|_| {})
            .build();

        assert_eq!(config.models_dir, PathBuf::from("/data/models"));
        assert_eq!(config.cache_dir, PathBuf::from("/data/staging"));
        assert!(!config.auto_download);
        assert!(!config.verify_checksum);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.progress.is_some());
    }
}
