//! Stability detection: the boundary between "writing" and "ready".
//!
//! A producer copying a large payload over SMB or SFTP generates a stream of
//! write events; the file must not enter the pipeline until its size and
//! mtime stop changing. The detector probes up to `attempts` times with a
//! fixed delay and declares stability on the first probe pair that matches.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::metrics::WatcherMetrics;

/// Probes a file's `(size, mtime)` until it stops changing.
#[derive(Debug, Clone)]
pub struct StabilityChecker {
    attempts: u32,
    delay: Duration,
    metrics: Arc<WatcherMetrics>,
}

impl StabilityChecker {
    pub fn new(attempts: u32, delay: Duration, metrics: Arc<WatcherMetrics>) -> Self {
        StabilityChecker {
            attempts,
            delay,
            metrics,
        }
    }

    /// Waits until the file stabilizes.
    ///
    /// Returns false when the file vanished, when all probes elapsed without
    /// two consecutive identical observations, or when `cancel` fired. The
    /// first probe has no predecessor and always waits. A single-probe
    /// configuration (`attempts <= 1`) accepts any file that still exists.
    pub async fn wait_for_stability(&self, path: &Path, cancel: &CancellationToken) -> bool {
        let started = Instant::now();

        if self.attempts <= 1 {
            let exists = std::fs::metadata(path).is_ok();
            if exists {
                self.metrics
                    .file_stability_seconds
                    .observe_duration(started.elapsed());
            }
            return exists;
        }

        let mut last: Option<(u64, SystemTime)> = None;

        for attempt in 0..self.attempts {
            let probe = match probe(path) {
                Some(p) => p,
                None => return false, // deleted or inaccessible
            };

            if last == Some(probe) {
                self.metrics
                    .file_stability_seconds
                    .observe_duration(started.elapsed());
                return true;
            }

            last = Some(probe);

            if attempt + 1 == self.attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        false
    }
}

fn probe(path: &Path) -> Option<(u64, SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some((meta.len(), modified))
}
