//! Path utilities for VoxLLM data directories.

use std::path::{Path, PathBuf};

/// Suffix appended to a model filename while it is being downloaded.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Suffix of the JSON sidecar describing a partial download.
pub const MANIFEST_SUFFIX: &str = ".part.json";

/// Suffix of a local file being imported by `install_from_path`.
pub const INSTALL_SUFFIX: &str = ".install.part";

/// Usage index kept inside the models directory.
pub const USAGE_INDEX: &str = ".voxllm-usage.json";

/// Get the VoxLLM data directory (~/.voxllm/).
///
/// Falls back to a relative `.voxllm` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".voxllm"))
        .unwrap_or_else(|| PathBuf::from(".voxllm"))
}

/// Get the default models directory (~/.voxllm/models/).
pub fn default_models_dir() -> PathBuf {
    data_dir().join("models")
}

/// Get the default staging directory for partial downloads (~/.voxllm/cache/).
pub fn default_cache_dir() -> PathBuf {
    data_dir().join("cache")
}

/// Path of a partial download inside `cache_dir`.
pub fn partial_path(cache_dir: &Path, filename: &str) -> PathBuf {
    cache_dir.join(format!("{}{}", filename, PARTIAL_SUFFIX))
}

/// Path of the sidecar manifest for a partial download.
pub fn manifest_path(cache_dir: &Path, filename: &str) -> PathBuf {
    cache_dir.join(format!("{}{}", filename, MANIFEST_SUFFIX))
}

/// Path of a local import staged inside `cache_dir`.
pub fn install_path(cache_dir: &Path, filename: &str) -> PathBuf {
    cache_dir.join(format!("{}{}", filename, INSTALL_SUFFIX))
}

/// Whether a file in the staging directory belongs to a download in progress.
pub fn is_staging_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(PARTIAL_SUFFIX) || name.ends_with(MANIFEST_SUFFIX))
        .unwrap_or(false)
}

/// Nearest ancestor of `path` (including itself) that exists on disk.
pub fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .map(|candidate| {
            if candidate.as_os_str().is_empty() {
                Path::new(".")
            } else {
                candidate
            }
        })
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_names() {
        let dir = Path::new("/tmp/cache");
        assert_eq!(
            partial_path(dir, "tiny.gguf"),
            PathBuf::from("/tmp/cache/tiny.gguf.part")
        );
        assert_eq!(
            manifest_path(dir, "tiny.gguf"),
            PathBuf::from("/tmp/cache/tiny.gguf.part.json")
        );
        assert!(is_staging_artifact(&partial_path(dir, "tiny.gguf")));
        assert!(is_staging_artifact(&manifest_path(dir, "tiny.gguf")));
        assert!(is_staging_artifact(&install_path(dir, "tiny.gguf")));
        assert_ne!(install_path(dir, "tiny.gguf"), partial_path(dir, "tiny.gguf"));
        assert!(!is_staging_artifact(Path::new("/tmp/cache/tiny.gguf")));
    }

    #[test]
    fn test_nearest_existing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a").join("b");
        assert_eq!(nearest_existing(&missing).as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_default_dirs_share_root() {
        assert!(default_models_dir().starts_with(data_dir()));
        assert!(default_cache_dir().starts_with(data_dir()));
    }
}
