//! Download progress reporting.

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;

/// Snapshot passed to the progress callback after every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub model_name: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f32,
}

impl DownloadProgress {
    pub(crate) fn new(model_name: &str, downloaded_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0.0
        } else {
            ((downloaded_bytes as f64 / total_bytes as f64) * 100.0).min(100.0) as f32
        };
        Self {
            model_name: model_name.to_string(),
            downloaded_bytes,
            total_bytes,
            percent,
        }
    }

    /// Final report for a finished transfer.
    pub(crate) fn complete(model_name: &str, total_bytes: u64) -> Self {
        Self {
            model_name: model_name.to_string(),
            downloaded_bytes: total_bytes,
            total_bytes,
            percent: 100.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.percent >= 100.0
    }
}

/// Callback invoked synchronously on the downloading task.
///
/// It must return promptly; the transfer does not advance while it runs.
/// Any caller context is captured by the closure.
#[derive(Clone)]
pub struct ProgressCallback(Arc<dyn Fn(&DownloadProgress) + Send + Sync>);

impl ProgressCallback {
    pub fn new(callback: impl Fn(&DownloadProgress) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub(crate) fn report(&self, progress: &DownloadProgress) {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressCallback(..)")
    }
}

/// Terminal progress bar driven by download callbacks.
pub fn progress_bar() -> ProgressCallback {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    ProgressCallback::new(move |progress: &DownloadProgress| {
        if pb.length() != Some(progress.total_bytes) {
            pb.set_length(progress.total_bytes);
            pb.set_message(progress.model_name.clone());
        }
        pb.set_position(progress.downloaded_bytes);
        if progress.is_complete() {
            pb.finish_with_message(format!("{} downloaded", progress.model_name));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_percent() {
        let progress = DownloadProgress::new("tiny", 250, 1000);
        assert_eq!(progress.percent, 25.0);
        assert!(!progress.is_complete());

        let unknown = DownloadProgress::new("tiny", 250, 0);
        assert_eq!(unknown.percent, 0.0);

        let overshoot = DownloadProgress::new("tiny", 1200, 1000);
        assert_eq!(overshoot.percent, 100.0);

        assert!(DownloadProgress::complete("tiny", 1000).is_complete());
    }

    #[test]
    fn test_callback_captures_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = ProgressCallback::new(move |p| sink.lock().unwrap().push(p.downloaded_bytes));

        callback.report(&DownloadProgress::new("tiny", 10, 100));
        callback.report(&DownloadProgress::new("tiny", 20, 100));

        assert_eq!(*seen.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_progress_bar_accepts_reports() {
        let callback = progress_bar();
        callback.report(&DownloadProgress::new("tiny", 10, 100));
        callback.report(&DownloadProgress::complete("tiny", 100));
    }
}
