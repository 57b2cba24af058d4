//! The ingestion daemon core.
//!
//! `Watcher` wires the pipeline together: OS filesystem notifications feed
//! an event loop; admitted paths go through stability detection, rate
//! limiting, and a bounded worker pool into the per-file ingestion
//! procedure. A directory supervisor and retention cleaner run beside the
//! pipeline, and one cancellation token fans out to every task.
//!
//! # Startup sequence
//!
//! 1. Create the working directory, staging subdirectories, and watch roots
//! 2. Reconcile orphans left in `processing/` by a previous run
//! 3. Start the worker pool, supervisor, cleaner, and task observer
//! 4. Scan each watch root: watch every directory, submit existing files
//! 5. Start the event loop
//!
//! # Shutdown sequence
//!
//! 1. Cancel the token; stop accepting new events
//! 2. Wait for stability tasks and loops to wind down
//! 3. Close the worker queue and drain in-flight work (bounded wait)
//! 4. Close the state store and the sink

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::{CleanupSettings, WatcherSettings};
use crate::metrics::WatcherMetrics;
use crate::sink::MessageSink;
use crate::store::StateStore;
use crate::types::IgnoreReason;

pub mod admission;
pub mod archive;
pub mod breaker;
pub mod cleaner;
pub mod fsops;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod stability;
pub mod supervisor;

use admission::{Admission, IgnoredPaths};
use cleaner::Cleaner;
use fsops::StagingLayout;
use pipeline::IngestPipeline;
use pool::{SubmitOutcome, WorkerPool};
use rate_limit::RateLimiter;
use stability::StabilityChecker;

/// Safety timeout wrapped around one file's stability wait.
const STABILITY_SAFETY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long shutdown waits for workers to finish in-flight publishes.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the task-count gauge is refreshed.
const TASK_GAUGE_INTERVAL: Duration = Duration::from_secs(10);

/// Errors that prevent the watcher from being built or started.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// A required setting is missing or contradictory.
    #[error("invalid watcher configuration: {0}")]
    Config(String),

    /// Directory creation or another filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The OS notification backend could not be initialized.
    #[error("failed to initialize filesystem watcher: {0}")]
    Notify(#[from] notify::Error),
}

/// Operation carried by a file event. Everything else the OS reports
/// (removes, renames, metadata changes) is dropped at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Create,
    Write,
}

/// The assembled ingestion daemon.
pub struct Watcher {
    inner: Arc<WatcherInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Result<notify::Event>>>>,
}

struct WatcherInner {
    cfg: WatcherSettings,
    cleanup: CleanupSettings,
    layout: StagingLayout,
    metrics: Arc<WatcherMetrics>,
    pipeline: Arc<IngestPipeline>,
    pool: Arc<WorkerPool>,
    rate_limiter: RateLimiter,
    stability: StabilityChecker,
    ignored: IgnoredPaths,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    fs_watcher: Mutex<RecommendedWatcher>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn MessageSink>,
}

impl Watcher {
    /// Builds the watcher and all of its components. Nothing runs until
    /// [`Watcher::start`].
    pub fn new(
        cfg: WatcherSettings,
        cleanup: CleanupSettings,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn MessageSink>,
        metrics: Arc<WatcherMetrics>,
    ) -> Result<Self, WatcherError> {
        if cfg.paths.is_empty() {
            return Err(WatcherError::Config(
                "at least one watch path is required".to_string(),
            ));
        }

        let layout = StagingLayout::new(&cfg.working_dir);
        let shutdown = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // The callback runs on notify's own thread; an unbounded send
        // never blocks it.
        let fs_watcher = notify::recommended_watcher(move |event| {
            let _ = events_tx.send(event);
        })?;

        let pipeline = Arc::new(IngestPipeline::new(
            layout.clone(),
            store.clone(),
            sink.clone(),
            metrics.clone(),
            cfg.min_file_size,
            cfg.max_file_size,
        ));
        let pool = Arc::new(WorkerPool::new(
            cfg.max_workers,
            cfg.worker_queue_size,
            metrics.clone(),
        ));
        let rate_limiter = RateLimiter::new(cfg.max_files_per_second);
        let stability =
            StabilityChecker::new(cfg.stable_attempts, cfg.stable_delay(), metrics.clone());

        Ok(Watcher {
            inner: Arc::new(WatcherInner {
                cfg,
                cleanup,
                layout,
                metrics,
                pipeline,
                pool,
                rate_limiter,
                stability,
                ignored: IgnoredPaths::new(),
                shutdown,
                tracker: TaskTracker::new(),
                fs_watcher: Mutex::new(fs_watcher),
                store,
                sink,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Starts every component and begins consuming events.
    pub async fn start(&self) -> Result<(), WatcherError> {
        let inner = &self.inner;

        info!(
            paths = ?inner.cfg.paths,
            workers = inner.cfg.max_workers,
            rate_limit = inner.cfg.max_files_per_second,
            "Starting watcher"
        );

        inner.layout.ensure()?;
        for path in &inner.cfg.paths {
            fsops::ensure_dir(path)?;
        }

        // Crash remnants in processing/ re-enter through the first root.
        match recovery::reconcile_orphans(&inner.layout, &inner.cfg.paths[0]) {
            Ok(count) if count > 0 => {
                info!(count, "Reconciled orphan files from previous run");
            }
            Ok(_) => {}
            Err(e) => {
                // Startup continues: orphans stay put until the next start.
                error!(error = %e, "Failed to reconcile orphans");
            }
        }

        inner
            .pool
            .start(inner.pipeline.clone(), inner.shutdown.clone());

        inner.tracker.spawn(supervisor::run(
            inner.layout.clone(),
            inner.shutdown.clone(),
        ));

        if inner.cleanup.enabled {
            let cleaner = Cleaner::new(
                inner.layout.clone(),
                inner.cleanup.clone(),
                inner.metrics.clone(),
            );
            inner.tracker.spawn(cleaner.run(inner.shutdown.clone()));
        }

        // Task-count observer.
        {
            let tracker = inner.tracker.clone();
            let metrics = inner.metrics.clone();
            let shutdown = inner.shutdown.clone();
            inner.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(TASK_GAUGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => metrics.tasks.set(tracker.len() as i64),
                    }
                }
            });
        }

        for path in inner.cfg.paths.clone() {
            info!(path = %path.display(), "Adding watch path");
            if let Err(e) = self.scan_and_watch(&path).await {
                error!(path = %path.display(), error = %e, "Failed to scan path");
            }
        }

        let Some(events_rx) = self.events_rx.lock().unwrap().take() else {
            return Err(WatcherError::Config("watcher already started".to_string()));
        };
        let loop_inner = inner.clone();
        inner
            .tracker
            .spawn(async move { event_loop(loop_inner, events_rx).await });

        info!("Watcher started");
        Ok(())
    }

    /// Stops the daemon gracefully.
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!("Stopping watcher");

        inner.shutdown.cancel();

        // Stop new events from the roots; watches on subdirectories die
        // with the notify handle when the watcher is dropped.
        {
            let mut fs_watcher = inner.fs_watcher.lock().unwrap();
            for path in &inner.cfg.paths {
                let _ = fs_watcher.unwatch(path);
            }
        }

        inner.tracker.close();
        inner.tracker.wait().await;

        inner.pool.stop(SHUTDOWN_DRAIN_TIMEOUT).await;

        if let Err(e) = inner.store.close().await {
            error!(error = %e, "Error closing state store");
        }
        if let Err(e) = inner.sink.close().await {
            error!(error = %e, "Error closing sink");
        }

        info!("Watcher stopped");
    }

    /// Walks a root: every directory joins the watch set, every existing
    /// file that passes admission is submitted (blocking, so pre-existing
    /// backlogs are never dropped).
    async fn scan_and_watch(&self, root: &Path) -> Result<(), WatcherError> {
        let inner = &self.inner;

        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Error accessing path during scan");
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                inner.watch_dir(entry.path());
                continue;
            }

            let filename = entry.file_name().to_string_lossy();
            let verdict = admission::admit(
                &filename,
                &inner.cfg.file_patterns,
                &inner.cfg.exclude_patterns,
            );
            if verdict == Admission::Admitted {
                info!(path = %entry.path().display(), "Submitting existing file from scan");
                inner.pool.submit_blocking(entry.path().to_path_buf()).await;
            }
        }

        Ok(())
    }

}

/// Consumes raw notification events until shutdown or channel close.
async fn event_loop(
    inner: Arc<WatcherInner>,
    mut events_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    info!("Event loop started");

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(Ok(event)) => inner.dispatch(event),
                Some(Err(e)) => {
                    error!(error = %e, "Watcher error");
                    inner.metrics.watcher_errors.inc();
                }
                None => break,
            }
        }
    }

    info!("Event loop stopped");
}

impl WatcherInner {
    /// Maps a raw notification onto pipeline events. Only creations and
    /// data writes are forwarded.
    fn dispatch(self: &Arc<Self>, event: notify::Event) {
        let op = match event.kind {
            EventKind::Create(_) => FileOp::Create,
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                FileOp::Write
            }
            _ => return,
        };

        for path in event.paths {
            self.handle_event(path, op);
        }
    }

    /// Handles one file event: admission, then a spawned stability wait so
    /// the dispatch path never blocks on a file settling.
    #[instrument(skip(self), fields(path = %path.display(), op = ?op))]
    fn handle_event(self: &Arc<Self>, path: PathBuf, op: FileOp) {
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            // Already deleted or moved; nothing to do.
            Err(_) => return,
        };

        if meta.is_dir() {
            self.watch_dir(&path);
            return;
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        // Zone.Identifier sidecars from SMB/Windows copies are noise:
        // delete immediately, never forward.
        if filename.ends_with(":Zone.Identifier") || filename.ends_with(".Zone.Identifier") {
            debug!("Deleting Zone.Identifier file");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, "Failed to delete Zone.Identifier file");
            }
            return;
        }

        match admission::admit(&filename, &self.cfg.file_patterns, &self.cfg.exclude_patterns) {
            Admission::Admitted => {}
            verdict => {
                let reason = match verdict {
                    Admission::Excluded => IgnoreReason::PatternExcluded,
                    _ => IgnoreReason::NoMatch,
                };
                debug!(reason = %reason, "File failed pattern admission");
                // The event source is at-least-once; only the first
                // sighting moves and counts the file.
                if self.ignored.first_sighting(&path) {
                    self.pipeline.move_to_ignored(&path, reason);
                }
                return;
            }
        }

        info!("File detected");

        let inner = self.clone();
        self.tracker.spawn(async move {
            inner.settle_and_submit(path).await;
        });
    }

    /// Waits for stability, applies the rate limit, and submits to the pool.
    async fn settle_and_submit(self: Arc<Self>, path: PathBuf) {
        let stable = tokio::time::timeout(
            STABILITY_SAFETY_TIMEOUT,
            self.stability.wait_for_stability(&path, &self.shutdown),
        )
        .await
        .unwrap_or(false);

        if !stable {
            warn!(path = %path.display(), "File did not stabilize");
            self.pipeline
                .move_to_ignored(&path, IgnoreReason::FileNotStable);
            return;
        }

        // Counted only once the file is stable and ready for processing.
        self.metrics.files_detected.inc();

        if !self.rate_limiter.try_acquire() {
            warn!(path = %path.display(), "Rate limit exceeded, dropping file");
            self.metrics.rate_limit_dropped.inc();
            self.pipeline
                .move_to_ignored(&path, IgnoreReason::RateLimitExceeded);
            return;
        }

        match self.pool.try_submit(path.clone()) {
            SubmitOutcome::Queued => {}
            SubmitOutcome::Full => {
                warn!(path = %path.display(), "Worker queue full, dropping file");
                self.metrics.rate_limit_dropped.inc();
                self.pipeline
                    .move_to_ignored(&path, IgnoreReason::QueueFull);
            }
            SubmitOutcome::Closed => {
                debug!(path = %path.display(), "Pool closed, dropping event");
            }
        }
    }

    /// Adds one directory to the watch set.
    fn watch_dir(&self, path: &Path) {
        let mut fs_watcher = self.fs_watcher.lock().unwrap();
        match fs_watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => debug!(path = %path.display(), "Directory added to watcher"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to add directory to watcher");
                self.metrics.watcher_errors.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::store::MemoryStore;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        metrics: Arc<WatcherMetrics>,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                dir: tempdir().unwrap(),
                metrics: Arc::new(WatcherMetrics::new()),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn settings(&self) -> WatcherSettings {
            WatcherSettings {
                paths: vec![self.dir.path().join("incoming")],
                file_patterns: vec!["*.xml".to_string(), "*.zip".to_string()],
                exclude_patterns: vec![".*".to_string(), "*.tmp".to_string()],
                min_file_size: 0,
                max_file_size: i64::MAX,
                stable_attempts: 2,
                stable_delay_ms: 10,
                max_workers: 2,
                worker_queue_size: 16,
                max_files_per_second: 100,
                working_dir: self.dir.path().join("work"),
            }
        }

        fn cleanup(&self) -> CleanupSettings {
            CleanupSettings {
                enabled: false,
                ..CleanupSettings::default()
            }
        }

        fn watcher(&self, settings: WatcherSettings) -> Watcher {
            Watcher::new(
                settings,
                self.cleanup(),
                Arc::new(MemoryStore::new()),
                self.sink.clone(),
                self.metrics.clone(),
            )
            .unwrap()
        }
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[test]
    fn empty_paths_are_rejected() {
        let fx = Fixture::new();
        let mut settings = fx.settings();
        settings.paths.clear();

        let result = Watcher::new(
            settings,
            fx.cleanup(),
            Arc::new(MemoryStore::new()),
            fx.sink.clone(),
            fx.metrics.clone(),
        );
        assert!(matches!(result, Err(WatcherError::Config(_))));
    }

    #[tokio::test]
    async fn startup_creates_layout_and_processes_existing_files() {
        let fx = Fixture::new();
        let settings = fx.settings();
        let incoming = settings.paths[0].clone();
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(incoming.join("pre-existing.xml"), b"<r>backlog</r>").unwrap();

        let watcher = fx.watcher(settings.clone());
        watcher.start().await.unwrap();

        let sink = fx.sink.clone();
        assert!(
            wait_until(5_000, || sink.len() == 1).await,
            "pre-existing file should be published"
        );

        let layout = StagingLayout::new(&settings.working_dir);
        for sub in layout.staging_dirs() {
            assert!(sub.is_dir());
        }
        assert!(layout.processing().join("pre-existing.xml").exists());

        watcher.stop().await;
    }

    #[tokio::test]
    async fn orphans_are_reprocessed_exactly_once_at_startup() {
        let fx = Fixture::new();
        let settings = fx.settings();
        let incoming = settings.paths[0].clone();

        // Seed an orphan in processing/ before the daemon starts.
        let layout = StagingLayout::new(&settings.working_dir);
        layout.ensure().unwrap();
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(layout.processing().join("orphan.xml"), b"<r>orphan</r>").unwrap();

        let watcher = fx.watcher(settings);
        watcher.start().await.unwrap();

        let sink = fx.sink.clone();
        assert!(
            wait_until(5_000, || sink.len() == 1).await,
            "orphan should be republished"
        );
        assert_eq!(fx.sink.published()[0].filename, "orphan.xml");
        assert!(layout.processing().join("orphan.xml").exists());

        watcher.stop().await;
        // Still exactly one message after shutdown.
        assert_eq!(fx.sink.len(), 1);
    }

    #[tokio::test]
    async fn dropped_file_flows_through_the_event_path() {
        let fx = Fixture::new();
        let settings = fx.settings();
        let incoming = settings.paths[0].clone();

        let watcher = fx.watcher(settings.clone());
        watcher.start().await.unwrap();

        // Drop a file after startup so it arrives via notify.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(incoming.join("dropped.xml"), b"<r>live</r>").unwrap();

        let sink = fx.sink.clone();
        assert!(
            wait_until(10_000, || sink.len() == 1).await,
            "dropped file should be published"
        );
        assert_eq!(fx.sink.published()[0].filename, "dropped.xml");

        let layout = StagingLayout::new(&settings.working_dir);
        assert!(layout.processing().join("dropped.xml").exists());

        watcher.stop().await;
    }

    #[tokio::test]
    async fn non_matching_file_is_ignored_once() {
        let fx = Fixture::new();
        let settings = fx.settings();
        let incoming = settings.paths[0].clone();

        let watcher = fx.watcher(settings.clone());
        watcher.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(incoming.join("notes.csv"), b"a,b,c").unwrap();

        let layout = StagingLayout::new(&settings.working_dir);
        let ignored = layout.ignored().join("notes.csv");
        assert!(
            wait_until(10_000, || ignored.exists()).await,
            "non-matching file should land in ignored/"
        );
        assert!(fx.sink.is_empty());

        watcher.stop().await;
        assert_eq!(fx.metrics.files_ignored.get(), 1);
    }

    #[tokio::test]
    async fn stop_is_clean_without_traffic() {
        let fx = Fixture::new();
        let watcher = fx.watcher(fx.settings());
        watcher.start().await.unwrap();
        watcher.stop().await;
        assert!(fx.sink.is_empty());
    }
}
