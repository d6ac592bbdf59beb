//! Model download and management.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ModelManagerConfig;
use crate::download::Transfer;
use crate::error::ModelError;
use crate::paths::{install_path, is_staging_artifact, partial_path};
use crate::registry::{self, ModelDescriptor};
use crate::storage::{available_space, has_enough_space, required_with_margin};
use crate::usage::{now_secs, ModelUsage, UsageIndex};
use crate::verify::{sha256_file, verify_file};

/// Local state of a model, recomputed from the filesystem on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelStatus {
    NotFound,
    Downloading,
    Available,
    Corrupted,
    Error,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::NotFound => "Not Found",
            ModelStatus::Downloading => "Downloading",
            ModelStatus::Available => "Available",
            ModelStatus::Corrupted => "Corrupted",
            ModelStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Manager for downloading and managing models.
///
/// Each instance owns its staging directory; run several managers only
/// with distinct `cache_dir`s.
pub struct ModelManager {
    config: ModelManagerConfig,
    client: reqwest::Client,
    in_flight: Mutex<HashSet<String>>,
    usage: UsageIndex,
}

/// Marks a descriptor as downloading for as long as it is alive.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl ModelManager {
    /// Create a new model manager.
    pub fn new(config: ModelManagerConfig) -> Result<Self, ModelError> {
        if config.models_dir.as_os_str().is_empty() {
            return Err(ModelError::InvalidArgument(
                "models_dir must not be empty".to_string(),
            ));
        }
        if config.cache_dir.as_os_str().is_empty() {
            return Err(ModelError::InvalidArgument(
                "cache_dir must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .user_agent(concat!("voxllm/", env!("CARGO_PKG_VERSION")))
            .build()?;

        debug!(
            "Model manager using models dir {:?}, staging dir {:?}",
            config.models_dir, config.cache_dir
        );

        Ok(Self {
            usage: UsageIndex::new(&config.models_dir),
            config,
            client,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Create a manager from environment configuration.
    pub fn from_env() -> Result<Self, ModelError> {
        Self::new(ModelManagerConfig::from_env())
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.config
    }

    /// Where `descriptor` lives once verified, regardless of its status.
    pub fn model_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.config.models_dir.join(descriptor.filename.as_ref())
    }

    /// Probe the filesystem for the state of `descriptor`.
    pub fn get_status(&self, descriptor: &ModelDescriptor) -> ModelStatus {
        let path = self.model_path(descriptor);

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => return self.check_integrity(descriptor, &path),
            Ok(_) => return ModelStatus::Error,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to stat {:?}: {}", path, e);
                return ModelStatus::Error;
            }
        }

        if self.is_in_flight(descriptor)
            || partial_path(&self.config.cache_dir, &descriptor.filename).exists()
        {
            ModelStatus::Downloading
        } else {
            ModelStatus::NotFound
        }
    }

    /// Check if a model is present and verified.
    pub fn is_available(&self, descriptor: &ModelDescriptor) -> bool {
        self.get_status(descriptor) == ModelStatus::Available
    }

    /// Get the path to a model, only if it is available. Counts as a use.
    pub fn get_path(&self, descriptor: &ModelDescriptor) -> Result<PathBuf, ModelError> {
        match self.get_status(descriptor) {
            ModelStatus::Available => {
                let path = self.model_path(descriptor);
                self.touch(descriptor, &path);
                Ok(path)
            }
            status => Err(ModelError::NotAvailable {
                name: descriptor.name.to_string(),
                status,
            }),
        }
    }

    /// Make `descriptor` available locally, downloading it if needed.
    ///
    /// On failure nothing is left in `models_dir`; an interrupted transfer
    /// stays in the staging directory so the next call can resume it.
    pub async fn ensure_available(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<PathBuf, ModelError> {
        validate_descriptor(descriptor)?;

        match self.get_status(descriptor) {
            ModelStatus::Available => {
                debug!("Model '{}' already available", descriptor.name);
                return Ok(self.model_path(descriptor));
            }
            ModelStatus::Corrupted => {
                warn!(
                    "Model '{}' failed verification, downloading a replacement",
                    descriptor.name
                );
            }
            _ => {}
        }

        if !self.config.auto_download {
            return Err(ModelError::NotAvailable {
                name: descriptor.name.to_string(),
                status: self.get_status(descriptor),
            });
        }

        let _guard = self.begin_download(descriptor)?;
        self.admit(descriptor)?;

        let transfer = Transfer::new(&self.client, &self.config, descriptor);
        let bytes = transfer.run().await?;

        if let Err(e) = self.verify_staged(descriptor, transfer.partial_path()) {
            transfer.discard();
            return Err(e);
        }

        let dest = self.model_path(descriptor);
        self.promote(transfer.partial_path(), &dest)?;
        transfer.finish();
        self.record_install(descriptor, &dest);

        info!(
            "Model '{}' downloaded successfully ({} bytes)",
            descriptor.name, bytes
        );
        Ok(dest)
    }

    /// Install a model from a local file, applying the same verification.
    pub fn install_from_path(
        &self,
        descriptor: &ModelDescriptor,
        source: &Path,
    ) -> Result<PathBuf, ModelError> {
        validate_descriptor(descriptor)?;

        let dest = self.model_path(descriptor);
        if source == dest {
            self.verify_staged(descriptor, source)?;
            return Ok(dest);
        }

        let _guard = self.begin_download(descriptor)?;
        let len = fs::metadata(source)?.len();
        if !has_enough_space(&self.config.models_dir, len) {
            return Err(self.insufficient_space(len));
        }

        info!("Installing model from {:?} to {:?}", source, dest);
        fs::create_dir_all(&self.config.cache_dir)?;
        // Separate from the download partial, which a later run may resume.
        let staged = install_path(&self.config.cache_dir, &descriptor.filename);
        let installed = fs::copy(source, &staged)
            .map_err(ModelError::from)
            .and_then(|_| self.verify_staged(descriptor, &staged))
            .and_then(|_| self.promote(&staged, &dest));
        if let Err(e) = installed {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        self.record_install(descriptor, &dest);
        Ok(dest)
    }

    /// Remove an installed model. Returns whether a file was removed.
    pub fn delete_model(&self, descriptor: &ModelDescriptor) -> Result<bool, ModelError> {
        let path = self.model_path(descriptor);
        let removed = match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed model: {}", descriptor.filename);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.forget(&[descriptor.name.to_string()]);
        Ok(removed)
    }

    /// Usage record of an installed model, if one was kept.
    pub fn usage(&self, descriptor: &ModelDescriptor) -> Option<ModelUsage> {
        self.usage.get(&descriptor.name)
    }

    /// Remove models whose last recorded use is older than `max_age`.
    ///
    /// Only models with a usage record are considered. Returns the names of
    /// the models whose files were removed.
    pub fn clear_unused_models(&self, max_age: Duration) -> Result<Vec<String>, ModelError> {
        let now = now_secs();
        let mut removed = Vec::new();
        let mut forgotten = Vec::new();

        for (name, record) in self.usage.load() {
            if record.idle_for(now) <= max_age {
                continue;
            }
            if !is_plain_filename(&record.filename) {
                warn!("Skipping usage record '{}' with invalid filename", name);
                continue;
            }
            if self.filename_in_flight(&record.filename) {
                continue;
            }

            let path = self.config.models_dir.join(&record.filename);
            match fs::remove_file(&path) {
                Ok(()) => removed.push(name.clone()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            forgotten.push(name);
        }

        if !forgotten.is_empty() {
            self.usage.update(|records| {
                for name in &forgotten {
                    records.remove(name);
                }
            })?;
        }
        if !removed.is_empty() {
            info!(
                "Removed {} unused models: {}",
                removed.len(),
                removed.join(", ")
            );
        }
        Ok(removed)
    }

    /// Remove every staging artifact. Returns the number of bytes freed.
    ///
    /// Partials of downloads running on this manager are kept.
    pub fn clean_cache(&self) -> Result<u64, ModelError> {
        let mut freed = 0;
        for path in self.staging_artifacts()? {
            if self.belongs_to_in_flight(&path) {
                continue;
            }
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path)?;
            freed += len;
        }
        info!("Cleaned model cache, freed {} bytes", freed);
        Ok(freed)
    }

    /// Bytes currently held by staging artifacts.
    pub fn cache_size(&self) -> Result<u64, ModelError> {
        let mut total = 0;
        for path in self.staging_artifacts()? {
            total += fs::metadata(&path)?.len();
        }
        Ok(total)
    }

    /// Catalog entries that are available locally.
    pub fn list_available(&self) -> Vec<&'static ModelDescriptor> {
        registry::all()
            .iter()
            .filter(|model| self.is_available(model))
            .collect()
    }

    fn check_integrity(&self, descriptor: &ModelDescriptor, path: &Path) -> ModelStatus {
        let expected = match descriptor.checksum() {
            Some(expected) if self.config.verify_checksum => expected,
            _ => return ModelStatus::Available,
        };

        match sha256_file(path) {
            Ok(actual) if crate::verify::checksums_match(expected, &actual) => {
                ModelStatus::Available
            }
            Ok(actual) => {
                debug!(
                    "Checksum mismatch for {:?}: expected {}, got {}",
                    path, expected, actual
                );
                ModelStatus::Corrupted
            }
            Err(e) => {
                warn!("Failed to hash {:?}: {}", path, e);
                ModelStatus::Error
            }
        }
    }

    fn verify_staged(&self, descriptor: &ModelDescriptor, path: &Path) -> Result<(), ModelError> {
        match descriptor.checksum() {
            Some(expected) if self.config.verify_checksum => {
                verify_file(path, expected).map_err(|e| {
                    warn!("Verification failed for '{}': {}", descriptor.name, e);
                    e
                })
            }
            Some(_) => {
                debug!("Checksum verification disabled, skipping '{}'", descriptor.name);
                Ok(())
            }
            None => {
                debug!("No checksum for '{}', verification skipped", descriptor.name);
                Ok(())
            }
        }
    }

    fn admit(&self, descriptor: &ModelDescriptor) -> Result<(), ModelError> {
        if has_enough_space(&self.config.models_dir, descriptor.size_bytes) {
            Ok(())
        } else {
            warn!(
                "Not enough space to download '{}' ({} bytes)",
                descriptor.name, descriptor.size_bytes
            );
            Err(self.insufficient_space(descriptor.size_bytes))
        }
    }

    fn insufficient_space(&self, bytes: u64) -> ModelError {
        ModelError::InsufficientSpace {
            required: required_with_margin(bytes),
            available: available_space(&self.config.models_dir).unwrap_or(0),
        }
    }

    /// Move a verified file into `models_dir`, replacing any file already
    /// there. The old file stays in place if the move fails.
    fn promote(&self, staged: &Path, dest: &Path) -> Result<(), ModelError> {
        fs::create_dir_all(&self.config.models_dir)?;

        if fs::rename(staged, dest).is_ok() {
            return Ok(());
        }

        // Different filesystems: copy next to the target, then rename there.
        let tmp = dest.with_file_name(format!(
            ".{}.tmp",
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let copied = fs::copy(staged, &tmp).and_then(|_| fs::rename(&tmp, dest));
        if let Err(e) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::remove_file(staged)?;
        Ok(())
    }

    fn record_install(&self, descriptor: &ModelDescriptor, path: &Path) {
        let size_bytes = fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(descriptor.size_bytes);
        let now = now_secs();
        let record = ModelUsage {
            filename: descriptor.filename.to_string(),
            size_bytes,
            sha256: descriptor.checksum().map(str::to_lowercase),
            installed_at: now,
            last_used: now,
            use_count: 0,
        };
        if let Err(e) = self.usage.update(|records| {
            records.insert(descriptor.name.to_string(), record);
        }) {
            warn!("Failed to record install of '{}': {}", descriptor.name, e);
        }
    }

    fn touch(&self, descriptor: &ModelDescriptor, path: &Path) {
        let now = now_secs();
        let result = self.usage.update(|records| {
            let record = records
                .entry(descriptor.name.to_string())
                .or_insert_with(|| ModelUsage {
                    filename: descriptor.filename.to_string(),
                    size_bytes: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                    sha256: descriptor.checksum().map(str::to_lowercase),
                    installed_at: now,
                    last_used: now,
                    use_count: 0,
                });
            record.last_used = now;
            record.use_count += 1;
        });
        if let Err(e) = result {
            warn!("Failed to record use of '{}': {}", descriptor.name, e);
        }
    }

    fn forget(&self, names: &[String]) {
        if let Err(e) = self.usage.update(|records| {
            for name in names {
                records.remove(name);
            }
        }) {
            warn!("Failed to update usage index: {}", e);
        }
    }

    fn begin_download(&self, descriptor: &ModelDescriptor) -> Result<InFlightGuard<'_>, ModelError> {
        let name = descriptor.filename.to_string();
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(name.clone()) {
            return Err(ModelError::DownloadInProgress(descriptor.name.to_string()));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            name,
        })
    }

    fn is_in_flight(&self, descriptor: &ModelDescriptor) -> bool {
        self.filename_in_flight(&descriptor.filename)
    }

    fn filename_in_flight(&self, filename: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(filename)
    }

    fn belongs_to_in_flight(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|filename| name.starts_with(filename.as_str()))
    }

    fn staging_artifacts(&self) -> Result<Vec<PathBuf>, ModelError> {
        let dir = &self.config.cache_dir;
        if !dir.exists() {
            return Ok(vec![]);
        }

        let artifacts = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_staging_artifact(path))
            .collect();

        Ok(artifacts)
    }
}

fn validate_descriptor(descriptor: &ModelDescriptor) -> Result<(), ModelError> {
    if descriptor.name.trim().is_empty() {
        return Err(ModelError::InvalidArgument("model name is empty".to_string()));
    }
    if descriptor.url.trim().is_empty() {
        return Err(ModelError::InvalidArgument(format!(
            "model '{}' has no download URL",
            descriptor.name
        )));
    }
    if !is_plain_filename(&descriptor.filename) {
        return Err(ModelError::InvalidArgument(format!(
            "model '{}' has an invalid filename '{}'",
            descriptor.name, descriptor.filename
        )));
    }
    Ok(())
}

/// A single path component that stays inside its directory.
fn is_plain_filename(filename: &str) -> bool {
    !(filename.is_empty() || filename == "." || filename == ".." || filename.contains(['/', '\\']))
}
