//! Usage records for installed models, kept as JSON in the models directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::ModelError;
use crate::paths::USAGE_INDEX;

/// What is known about one installed model. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub installed_at: u64,
    pub last_used: u64,
    pub use_count: u64,
}

impl ModelUsage {
    /// Time since the model was last used, as of `now`.
    pub fn idle_for(&self, now: u64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.last_used))
    }
}

/// Records keyed by model name.
pub(crate) type UsageRecords = BTreeMap<String, ModelUsage>;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) struct UsageIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UsageIndex {
    pub(crate) fn new(models_dir: &Path) -> Self {
        Self {
            path: models_dir.join(USAGE_INDEX),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn load(&self) -> UsageRecords {
        let _guard = self.guard();
        self.read()
    }

    pub(crate) fn get(&self, name: &str) -> Option<ModelUsage> {
        self.load().remove(name)
    }

    /// Read, modify and write the index under one lock. Nothing is written
    /// when `f` leaves the records unchanged.
    pub(crate) fn update(&self, f: impl FnOnce(&mut UsageRecords)) -> Result<(), ModelError> {
        let _guard = self.guard();
        let before = self.read();
        let mut records = before.clone();
        f(&mut records);
        if records == before {
            return Ok(());
        }
        self.write(&records)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A missing or unreadable index counts as empty.
    fn read(&self) -> UsageRecords {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return UsageRecords::new(),
            Err(e) => {
                warn!("Failed to read usage index {:?}: {}", self.path, e);
                return UsageRecords::new();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Ignoring malformed usage index {:?}: {}", self.path, e);
            UsageRecords::new()
        })
    }

    fn write(&self, records: &UsageRecords) -> Result<(), ModelError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last_used: u64) -> ModelUsage {
        ModelUsage {
            filename: "m.gguf".to_string(),
            size_bytes: 4,
            sha256: None,
            installed_at: last_used,
            last_used,
            use_count: 0,
        }
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let index = UsageIndex::new(&dir.path().join("models"));
        assert!(index.load().is_empty());

        index
            .update(|records| {
                records.insert("m".to_string(), record(100));
            })
            .unwrap();

        let reopened = UsageIndex::new(&dir.path().join("models"));
        assert_eq!(reopened.get("m"), Some(record(100)));
        assert!(dir.path().join("models").join(USAGE_INDEX).exists());
    }

    #[test]
    fn test_unchanged_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = UsageIndex::new(&dir.path().join("models"));

        index
            .update(|records| {
                records.remove("missing");
            })
            .unwrap();
        assert!(!dir.path().join("models").exists());
    }

    #[test]
    fn test_malformed_index_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(USAGE_INDEX), b"not json").unwrap();

        let index = UsageIndex::new(dir.path());
        assert!(index.load().is_empty());
        index
            .update(|records| {
                records.insert("m".to_string(), record(1));
            })
            .unwrap();
        assert_eq!(index.load().len(), 1);
    }

    #[test]
    fn test_idle_for() {
        assert_eq!(record(100).idle_for(160), Duration::from_secs(60));
        assert_eq!(record(100).idle_for(50), Duration::ZERO);
    }
}
