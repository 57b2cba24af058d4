//! The per-file ingestion procedure.
//!
//! One invocation drives a single path through the full state machine:
//! size guard, archive handoff, fingerprinting, idempotency probe,
//! distributed lock, staging move, publish under retry and circuit breaker,
//! and terminal classification. Per-fingerprint, at most one worker is
//! inside the move-and-publish region cluster-wide; the state-store lock
//! enforces it and is released on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::metrics::WatcherMetrics;
use crate::sink::{FileMessage, MessageSink};
use crate::store::{StateStore, StoreError};
use crate::types::{FailReason, Fingerprint, IgnoreReason, IngestRecord, IngestState};

use super::archive::{self, ArchiveError};
use super::breaker::{BreakerError, CircuitBreaker};
use super::fsops::{self, StagingLayout};
use super::retry::{RetryConfig, RetryError, retry_with_backoff};

/// Consecutive publish failures before the breaker opens.
const BREAKER_MAX_FAILURES: u32 = 5;

/// How long the breaker stays open before a half-open trial.
const BREAKER_RESET_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Read chunk size for fingerprinting.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Errors surfaced by one pipeline invocation.
///
/// Most per-file outcomes (rejection, duplicate, rate limiting) are not
/// errors: the file lands in a terminal directory and the invocation
/// succeeds. Errors mean the invocation could not run to a terminal state.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source file could not be stat'ed.
    #[error("failed to stat file: {0}")]
    Stat(#[source] std::io::Error),

    /// The source file could not be opened or read for hashing.
    #[error("failed to hash file: {0}")]
    Hash(#[source] std::io::Error),

    /// The move into `processing/` failed.
    #[error("failed to move file into processing: {0}")]
    Stage(#[source] std::io::Error),

    /// Archive expansion failed.
    #[error("archive expansion failed: {0}")]
    Archive(#[from] ArchiveError),

    /// Publishing failed terminally (retries exhausted or breaker open).
    #[error("publish failed: {0}")]
    Publish(String),

    /// The shutdown token fired mid-invocation.
    #[error("cancelled")]
    Cancelled,
}

/// The ingestion procedure with its collaborators.
pub struct IngestPipeline {
    layout: StagingLayout,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn MessageSink>,
    metrics: Arc<WatcherMetrics>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    min_file_size: i64,
    max_file_size: i64,
}

impl IngestPipeline {
    pub fn new(
        layout: StagingLayout,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn MessageSink>,
        metrics: Arc<WatcherMetrics>,
        min_file_size: i64,
        max_file_size: i64,
    ) -> Self {
        IngestPipeline {
            layout,
            store,
            sink,
            metrics,
            breaker: CircuitBreaker::new(BREAKER_MAX_FAILURES, BREAKER_RESET_TIMEOUT),
            retry: RetryConfig::DEFAULT,
            min_file_size,
            max_file_size,
        }
    }

    /// Runs the full procedure for one path, recording the processing time.
    #[instrument(skip(self, cancel), fields(path = %path.display()))]
    pub async fn process(&self, path: &Path, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = self.run(path, cancel).await;
        self.metrics
            .file_processing_seconds
            .observe_duration(started.elapsed());
        result
    }

    async fn run(&self, path: &Path, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        info!("Processing file");

        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                // Transient: the file may already have moved on. Leave all
                // state untouched.
                warn!(error = %e, "Failed to stat file");
                return Err(PipelineError::Stat(e));
            }
        };

        let size = meta.len() as i64;
        self.metrics.file_size_bytes.observe(size as f64);

        let mut record = IngestRecord::new(path, size);

        if size < self.min_file_size {
            warn!(size, min = self.min_file_size, "File too small");
            self.move_to_ignored(path, IgnoreReason::FileTooSmall);
            self.metrics.files_rejected.inc();
            return Ok(());
        }
        if size > self.max_file_size {
            warn!(size, max = self.max_file_size, "File too large");
            self.move_to_ignored(path, IgnoreReason::FileTooLarge);
            self.metrics.files_rejected.inc();
            return Ok(());
        }
        record.state = IngestState::Admitted;

        if archive::is_zip_file(path) {
            return self.expand_archive(path);
        }

        let fingerprint = match self.fingerprint(path, cancel).await {
            Ok(fingerprint) => fingerprint,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                // Leave the file in place; a later event retries it.
                error!(error = %e, "Failed to fingerprint file");
                self.metrics.watcher_errors.inc();
                return Err(e);
            }
        };
        trace!(hash = %fingerprint, "File fingerprinted");
        record.fingerprint = Some(fingerprint.clone());
        record.state = IngestState::Hashed;

        // Idempotency probe. A store failure fails open: we proceed as
        // "not processed" rather than stalling the pipeline on an outage.
        // The trade-off is a possible duplicate publish while the store is
        // down; the fingerprint lock below still narrows the window.
        match self.store.is_processed(&fingerprint).await {
            Ok(true) => {
                info!(hash = %fingerprint.short(), "Duplicate within dedup window");
                self.move_to_ignored(path, IgnoreReason::Duplicate);
                self.metrics.files_duplicated.inc();
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Idempotency probe failed, continuing as unprocessed");
                self.metrics.storage_errors.inc();
            }
        }

        let token = match self.store.try_lock(&fingerprint).await {
            Ok(token) => token,
            Err(StoreError::LockHeld) => {
                // Another worker owns this fingerprint; nothing to do here.
                info!(hash = %fingerprint.short(), "Lock held elsewhere, skipping");
                self.metrics.files_duplicated.inc();
                return Ok(());
            }
            Err(e) => {
                // Conservative: without the lock we neither move nor publish.
                warn!(error = %e, "Failed to acquire lock, skipping file");
                self.metrics.storage_errors.inc();
                return Ok(());
            }
        };
        record.state = IngestState::Locked;

        let outcome = self.stage_and_publish(&mut record, &fingerprint, cancel).await;

        // The lock is released on every exit from the staging region,
        // success or not.
        if let Err(e) = self.store.release_lock(&fingerprint, &token).await {
            warn!(hash = %fingerprint.short(), error = %e, "Failed to release lock");
        }

        outcome
    }

    /// Moves the file into `processing/` and publishes its message.
    async fn stage_and_publish(
        &self,
        record: &mut IngestRecord,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let staged = match self.move_to_processing(&record.source_path) {
            Ok(staged) => staged,
            Err(e) => {
                error!(error = %e, "Failed to move file into processing");
                self.metrics.watcher_errors.inc();
                return Err(PipelineError::Stage(e));
            }
        };
        record.staged_path = Some(staged.clone());
        record.state = IngestState::Staged;

        // Non-fatal: a missing enqueued marker only widens the recovery
        // window, it does not block delivery.
        if let Err(e) = self.store.mark_enqueued(fingerprint, &staged).await {
            warn!(error = %e, "Failed to mark file as enqueued");
            self.metrics.storage_errors.inc();
        }

        let msg = FileMessage::from_record(record, fingerprint);

        let publish_result = self
            .breaker
            .call(|| retry_with_backoff(self.retry, cancel, || self.sink.publish(&msg)))
            .await;

        match publish_result {
            Ok(()) => {
                self.metrics.files_sent.inc();
                self.metrics.files_processed.inc();
                record.state = IngestState::Published;
                // The staged file deliberately stays in processing/: the
                // downstream consumer owns the move to processed/ once it
                // has consumed the message.
                info!(
                    hash = %fingerprint.short(),
                    size = record.size_bytes,
                    kind = %record.kind,
                    "File enqueued, awaiting downstream pickup"
                );
                Ok(())
            }
            Err(BreakerError::Inner(RetryError::Cancelled)) => {
                // Shutdown mid-publish: leave the staged file where it is;
                // orphan reconciliation re-runs it on the next start.
                debug!(hash = %fingerprint.short(), "Publish abandoned by shutdown");
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                let detail = e.to_string();
                error!(error = %detail, "Failed to publish after retries");
                record.state = IngestState::Failed;
                self.move_to_failed(&staged, &FailReason::QueueError(detail.clone()));
                if let Err(se) = self.store.mark_failed(fingerprint, &detail).await {
                    warn!(error = %se, "Failed to record failure in store");
                    self.metrics.storage_errors.inc();
                }
                self.metrics.queue_errors.inc();
                Err(PipelineError::Publish(detail))
            }
        }
    }

    /// Expands a `.zip` payload into `processing/` and deletes the archive.
    ///
    /// Extracted entries re-enter the pipeline through the watched tree;
    /// this invocation is terminal for the archive itself.
    fn expand_archive(&self, path: &Path) -> Result<(), PipelineError> {
        info!("Archive detected, expanding");

        match archive::extract_zip(path, &self.layout.processing()) {
            Ok(extracted) => {
                info!(entries = extracted.len(), "Archive expanded");
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(error = %e, "Failed to delete archive after expansion");
                } else {
                    debug!("Archive deleted after expansion");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Archive expansion failed");
                self.move_to_failed(path, &FailReason::ZipExtractionFailed);
                self.metrics.watcher_errors.inc();
                Err(e.into())
            }
        }
    }

    /// Computes the fingerprint: SHA-256 over `basename ++ file_bytes`.
    async fn fingerprint(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint, PipelineError> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(PipelineError::Hash)?;

        let mut hasher = Sha256::new();
        hasher.update(basename.as_bytes());

        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let n = file.read(&mut buf).await.map_err(PipelineError::Hash)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Fingerprint::from_digest(hasher.finalize()))
    }

    /// Moves a file into `processing/`, preserving its basename.
    fn move_to_processing(&self, path: &Path) -> std::io::Result<PathBuf> {
        let Some(filename) = path.file_name() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no filename",
            ));
        };
        let dest = self.layout.processing().join(filename);
        fsops::move_file(path, &dest)?;
        debug!(from = %path.display(), to = %dest.display(), "File moved to processing");
        Ok(dest)
    }

    /// Moves a file into `ignored/` and counts it.
    pub(crate) fn move_to_ignored(&self, path: &Path, reason: IgnoreReason) {
        let Some(filename) = path.file_name() else {
            return;
        };
        let dest = self.layout.ignored().join(filename);
        match fsops::move_file(path, &dest) {
            Ok(()) => {
                info!(path = %dest.display(), reason = %reason, "File moved to ignored");
                self.metrics.files_ignored.inc();
            }
            Err(e) => {
                error!(
                    src = %path.display(),
                    dest = %dest.display(),
                    error = %e,
                    "Failed to move file to ignored"
                );
            }
        }
    }

    /// Moves a file into `failed/`.
    fn move_to_failed(&self, path: &Path, reason: &FailReason) {
        let Some(filename) = path.file_name() else {
            return;
        };
        let dest = self.layout.failed().join(filename);
        match fsops::move_file(path, &dest) {
            Ok(()) => {
                warn!(path = %dest.display(), reason = %reason, "File moved to failed");
            }
            Err(e) => {
                error!(
                    src = %path.display(),
                    dest = %dest.display(),
                    error = %e,
                    "Failed to move file to failed"
                );
            }
        }
    }

    /// Breaker position, for observability and tests.
    pub fn breaker_state(&self) -> super::breaker::BreakerState {
        self.breaker.state()
    }
}
