//! Resumable HTTP transfer into the staging directory.

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ModelManagerConfig;
use crate::error::ModelError;
use crate::paths::{manifest_path, partial_path};
use crate::progress::DownloadProgress;
use crate::registry::ModelDescriptor;

/// Sidecar written next to a partial download so a later run can tell
/// whether the bytes on disk belong to the same source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StagingManifest {
    pub url: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

impl StagingManifest {
    fn for_descriptor(descriptor: &ModelDescriptor) -> Self {
        Self {
            url: descriptor.url.to_string(),
            size_bytes: descriptor.size_bytes,
            sha256: descriptor.checksum().map(str::to_lowercase),
        }
    }
}

/// Outcome of one HTTP attempt.
enum AttemptError {
    /// Worth retrying from the current partial length.
    Transient(String),
    /// Retrying cannot help.
    Fatal(ModelError),
}

impl From<io::Error> for AttemptError {
    fn from(e: io::Error) -> Self {
        AttemptError::Fatal(ModelError::Io(e))
    }
}

/// Downloads one descriptor into `cache_dir/<filename>.part`.
pub(crate) struct Transfer<'a> {
    client: &'a reqwest::Client,
    config: &'a ModelManagerConfig,
    descriptor: &'a ModelDescriptor,
    partial: PathBuf,
    manifest: PathBuf,
}

impl<'a> Transfer<'a> {
    pub(crate) fn new(
        client: &'a reqwest::Client,
        config: &'a ModelManagerConfig,
        descriptor: &'a ModelDescriptor,
    ) -> Self {
        Self {
            client,
            config,
            descriptor,
            partial: partial_path(&config.cache_dir, &descriptor.filename),
            manifest: manifest_path(&config.cache_dir, &descriptor.filename),
        }
    }

    pub(crate) fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Remove the staging file and its sidecar.
    pub(crate) fn discard(&self) {
        for path in [&self.partial, &self.manifest] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove staging file {:?}: {}", path, e);
                }
            }
        }
    }

    /// Remove only the sidecar, after the partial has been promoted.
    pub(crate) fn finish(&self) {
        let _ = fs::remove_file(&self.manifest);
    }

    /// Run the transfer with retries. Returns the number of bytes staged.
    pub(crate) async fn run(&self) -> Result<u64, ModelError> {
        fs::create_dir_all(&self.config.cache_dir)?;
        self.prepare_staging()?;

        let mut retries = 0u32;
        loop {
            match self.attempt().await {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(reason)) => {
                    if retries >= self.config.max_retries {
                        return Err(ModelError::Network(format!(
                            "{} (gave up after {} attempts)",
                            reason,
                            retries + 1
                        )));
                    }
                    retries += 1;
                    let delay = self.config.retry_backoff * retries;
                    warn!(
                        "Download of '{}' interrupted: {}. Retry {}/{} in {:?}",
                        self.descriptor.name, reason, retries, self.config.max_retries, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Keep a partial only if its sidecar (when present) matches this descriptor.
    fn prepare_staging(&self) -> Result<(), ModelError> {
        let expected = StagingManifest::for_descriptor(self.descriptor);

        if self.partial.exists() {
            let stale = match fs::read(&self.manifest) {
                Ok(bytes) => match serde_json::from_slice::<StagingManifest>(&bytes) {
                    Ok(found) => found != expected,
                    Err(_) => true,
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };

            if stale {
                info!(
                    "Discarding partial download of '{}' from a different source",
                    self.descriptor.name
                );
                fs::remove_file(&self.partial)?;
            }
        }

        fs::write(&self.manifest, serde_json::to_vec_pretty(&expected)?)?;
        Ok(())
    }

    async fn attempt(&self) -> Result<u64, AttemptError> {
        let offset = match fs::metadata(&self.partial) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut request = self.client.get(self.descriptor.url.as_ref());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = match timeout(self.config.timeout, request.send()).await {
            Err(_) => {
                return Err(AttemptError::Transient(format!(
                    "no response within {:?}",
                    self.config.timeout
                )))
            }
            Ok(Err(e)) if e.is_builder() => {
                return Err(AttemptError::Fatal(ModelError::Http(e)));
            }
            Ok(Err(e)) => return Err(AttemptError::Transient(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let (file, start, total) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let total = content_range_total(&response)
                    .or_else(|| response.content_length().map(|len| offset + len));
                info!(
                    "Resuming download of '{}' from byte {}",
                    self.descriptor.name, offset
                );
                let file = OpenOptions::new().append(true).open(&self.partial)?;
                (file, offset, total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                return self.handle_unsatisfiable(&response, offset);
            }
            s if s.is_success() => {
                if offset > 0 {
                    debug!("Server ignored range request, restarting from zero");
                }
                info!(
                    "Downloading model '{}' from {}",
                    self.descriptor.name, self.descriptor.url
                );
                (File::create(&self.partial)?, 0, response.content_length())
            }
            s if is_transient_status(s) => {
                return Err(AttemptError::Transient(format!("HTTP {}", s)));
            }
            s => {
                return Err(AttemptError::Fatal(ModelError::Network(format!(
                    "HTTP {}: {}",
                    s, self.descriptor.url
                ))));
            }
        };

        let downloaded = self.stream_body(response, file, start, total).await?;

        // Without a length from the server the catalog size is the only bound.
        let expected = total.or(Some(self.descriptor.size_bytes).filter(|&size| size > 0));
        if let Some(total) = expected {
            if downloaded < total {
                return Err(AttemptError::Transient(format!(
                    "connection closed after {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        self.report(&DownloadProgress::complete(&self.descriptor.name, downloaded));
        debug!("Staged {} bytes at {:?}", downloaded, self.partial);
        Ok(downloaded)
    }

    async fn stream_body(
        &self,
        response: Response,
        mut file: File,
        start: u64,
        total: Option<u64>,
    ) -> Result<u64, AttemptError> {
        let display_total = total.unwrap_or(self.descriptor.size_bytes);
        let mut downloaded = start;
        let mut stream = response.bytes_stream();

        loop {
            let next = match timeout(self.config.timeout, stream.next()).await {
                Err(_) => {
                    file.flush()?;
                    return Err(AttemptError::Transient(format!(
                        "no data received for {:?}",
                        self.config.timeout
                    )));
                }
                Ok(next) => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush()?;
                    return Err(AttemptError::Transient(e.to_string()));
                }
            };

            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            self.report(&DownloadProgress::new(
                &self.descriptor.name,
                downloaded,
                display_total.max(downloaded),
            ));
        }

        file.flush()?;
        file.sync_all()?;
        Ok(downloaded)
    }

    /// A 416 either means the partial already holds the whole payload or
    /// that it is longer than the remote file.
    fn handle_unsatisfiable(&self, response: &Response, offset: u64) -> Result<u64, AttemptError> {
        match content_range_total(response) {
            Some(total) if total == offset => {
                debug!("Partial download already complete ({} bytes)", offset);
                self.report(&DownloadProgress::complete(&self.descriptor.name, offset));
                Ok(offset)
            }
            _ => {
                fs::remove_file(&self.partial)?;
                Err(AttemptError::Transient(format!(
                    "partial of {} bytes does not match remote file, restarting",
                    offset
                )))
            }
        }
    }

    fn report(&self, progress: &DownloadProgress) {
        if let Some(callback) = &self.config.progress {
            callback.report(progress);
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Total length from `Content-Range: bytes a-b/total` or `bytes */total`.
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range_total)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 400-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes */1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_manifest_mismatch_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelManagerConfig::builder()
            .models_dir(dir.path().join("models"))
            .cache_dir(dir.path().join("cache"))
            .build();
        fs::create_dir_all(&config.cache_dir).unwrap();

        let client = reqwest::Client::new();
        let old = ModelDescriptor::new("tiny", "http://old.example/tiny.gguf", "tiny.gguf", 1000);
        let new = ModelDescriptor::new("tiny", "http://new.example/tiny.gguf", "tiny.gguf", 1000);

        let transfer = Transfer::new(&client, &config, &old);
        transfer.prepare_staging().unwrap();
        fs::write(transfer.partial_path(), vec![0u8; 100]).unwrap();

        // Same source: partial survives.
        transfer.prepare_staging().unwrap();
        assert!(transfer.partial_path().exists());

        // Different source: partial is dropped and the sidecar rewritten.
        let transfer = Transfer::new(&client, &config, &new);
        transfer.prepare_staging().unwrap();
        assert!(!transfer.partial_path().exists());
        let manifest: StagingManifest =
            serde_json::from_slice(&fs::read(&transfer.manifest).unwrap()).unwrap();
        assert_eq!(manifest.url, "http://new.example/tiny.gguf");
    }
}
