//! Retention cleaner.
//!
//! Two periodic jobs share one task: an empty-directory sweep over the
//! working directory (producers drag whole directory trees in, and expanded
//! archives leave shells behind), and age-based retention over the terminal
//! staging directories. `tmp/` has retention zero and is always emptied;
//! the five staging subdirectories and the working directory itself are
//! never removed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::CleanupSettings;
use crate::metrics::WatcherMetrics;

use super::fsops::StagingLayout;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Periodic empty-directory sweeper and retention enforcer.
pub struct Cleaner {
    layout: StagingLayout,
    settings: CleanupSettings,
    protected: HashSet<PathBuf>,
    metrics: Arc<WatcherMetrics>,
}

impl Cleaner {
    pub fn new(
        layout: StagingLayout,
        settings: CleanupSettings,
        metrics: Arc<WatcherMetrics>,
    ) -> Self {
        let protected = layout.staging_dirs().into_iter().collect();
        Cleaner {
            layout,
            settings,
            protected,
            metrics,
        }
    }

    /// Runs both schedules until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.settings.sweep_interval_secs.max(1),
        ));
        let mut retention =
            tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sweep.tick() => self.sweep_empty_directories(),
                _ = retention.tick() => self.apply_retention(),
            }
        }
    }

    /// Removes empty directories under the working directory, skipping the
    /// protected staging set.
    pub(crate) fn sweep_empty_directories(&self) {
        debug!("Starting empty-directory sweep");

        // contents_first visits children before parents, so a chain of
        // nested empty directories disappears in a single pass.
        for entry in WalkDir::new(self.layout.working_dir())
            .min_depth(1)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if self.protected.contains(path) {
                continue;
            }

            let is_empty = match std::fs::read_dir(path) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => continue,
            };
            if !is_empty {
                continue;
            }

            debug!(path = %path.display(), "Removing empty directory");
            match std::fs::remove_dir(path) {
                Ok(()) => self.metrics.empty_directories_removed.inc(),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to remove empty directory");
                }
            }
        }
    }

    /// Applies the retention policy to the terminal directories.
    pub(crate) fn apply_retention(&self) {
        info!("Starting retention pass");

        // tmp/ is transient scratch space: always emptied.
        self.clean_directory(&self.layout.tmp(), 0, "tmp");

        let policies = [
            (
                self.layout.processed(),
                self.settings.retention_processed_days,
                "processed",
            ),
            (
                self.layout.failed(),
                self.settings.retention_failed_days,
                "failed",
            ),
            (
                self.layout.ignored(),
                self.settings.retention_ignored_days,
                "ignored",
            ),
        ];

        for (dir, days, label) in policies {
            if days > 0 {
                self.clean_directory(&dir, days, label);
            }
        }

        info!("Retention pass complete");
    }

    /// Deletes files older than `retention_days` under `dir`; zero means
    /// delete everything.
    fn clean_directory(&self, dir: &Path, retention_days: u32, label: &str) {
        let cutoff =
            SystemTime::now() - Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);

        let mut deleted = 0u64;
        let mut freed = 0u64;

        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let aged_out = retention_days == 0
                || meta.modified().map(|m| m < cutoff).unwrap_or(false);
            if !aged_out {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    deleted += 1;
                    freed += meta.len();
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to delete file");
                }
            }
        }

        if deleted > 0 {
            info!(
                directory = label,
                files_deleted = deleted,
                bytes_freed = freed,
                retention_days,
                "Retention cleanup complete"
            );
        }
    }
}
