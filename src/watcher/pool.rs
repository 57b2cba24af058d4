//! Bounded worker pool for the ingestion procedure.
//!
//! A FIFO channel of paths feeds a fixed number of workers. The event path
//! submits without blocking (a full queue diverts the file); the startup
//! scan submits blocking so pre-existing files are never lost. When the
//! pool stops, the channel is closed and workers drain the remaining items
//! before returning; in-flight work stays cancellable through the shutdown
//! token handed to each job.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::WatcherMetrics;

use super::pipeline::IngestPipeline;

/// Outcome of a non-blocking submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The path entered the queue.
    Queued,
    /// The queue was full; the path was not enqueued.
    Full,
    /// The pool has been stopped.
    Closed,
}

/// Fixed-size worker pool over a bounded FIFO queue.
pub struct WorkerPool {
    workers: usize,
    tx: Mutex<Option<mpsc::Sender<PathBuf>>>,
    rx: Mutex<Option<mpsc::Receiver<PathBuf>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<WatcherMetrics>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_size: usize, metrics: Arc<WatcherMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        WorkerPool {
            workers: workers.max(1),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            handles: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Spawns the workers. Calling more than once has no effect.
    pub fn start(&self, pipeline: Arc<IngestPipeline>, shutdown: CancellationToken) {
        let Some(rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                pipeline.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )));
        }
    }

    /// Non-blocking submission for the event path.
    pub fn try_submit(&self, path: PathBuf) -> SubmitOutcome {
        let sender = self.tx.lock().unwrap().clone();
        let Some(tx) = sender else {
            return SubmitOutcome::Closed;
        };

        let outcome = match tx.try_send(path) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SubmitOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitOutcome::Closed,
        };
        self.update_queue_gauge(&tx);
        outcome
    }

    /// Blocking submission for the startup scan: waits for queue capacity
    /// instead of dropping. Returns false once the pool is stopped.
    pub async fn submit_blocking(&self, path: PathBuf) -> bool {
        let sender = self.tx.lock().unwrap().clone();
        let Some(tx) = sender else {
            return false;
        };

        let sent = tx.send(path).await.is_ok();
        self.update_queue_gauge(&tx);
        sent
    }

    /// Closes the queue and waits for workers to drain, up to `drain_timeout`.
    pub async fn stop(&self, drain_timeout: Duration) {
        self.tx.lock().unwrap().take();

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!(
                timeout_secs = drain_timeout.as_secs(),
                "Worker pool did not drain in time"
            );
        }
    }

    /// Current queue depth, for tests and the gauge.
    pub fn queue_depth(&self) -> usize {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    fn update_queue_gauge(&self, tx: &mpsc::Sender<PathBuf>) {
        let depth = tx.max_capacity() - tx.capacity();
        self.metrics.worker_pool_queue_size.set(depth as i64);
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PathBuf>>>,
    pipeline: Arc<IngestPipeline>,
    metrics: Arc<WatcherMetrics>,
    shutdown: CancellationToken,
) {
    debug!(worker = worker_id, "Worker started");

    loop {
        // Hold the receiver lock only for the pop; a closed channel ends
        // the loop after the queue is drained.
        let path = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(path) = path else { break };

        metrics.worker_pool_active_workers.inc();

        if let Err(e) = pipeline.process(&path, &shutdown).await {
            // The pipeline already logged the failure with context.
            debug!(worker = worker_id, error = %e, "Job finished with error");
        }

        metrics.worker_pool_active_workers.dec();
    }

    debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::store::MemoryStore;
    use crate::watcher::fsops::StagingLayout;
    use tempfile::tempdir;

    fn pipeline(layout: StagingLayout, sink: Arc<MemorySink>) -> Arc<IngestPipeline> {
        Arc::new(IngestPipeline::new(
            layout,
            Arc::new(MemoryStore::new()),
            sink,
            Arc::new(WatcherMetrics::new()),
            0,
            i64::MAX,
        ))
    }

    #[tokio::test]
    async fn queued_files_are_processed_and_drained_on_stop() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();

        let inbox = dir.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();

        let sink = Arc::new(MemorySink::new());
        let pool = WorkerPool::new(2, 8, Arc::new(WatcherMetrics::new()));
        pool.start(pipeline(layout.clone(), sink.clone()), CancellationToken::new());

        for i in 0..4 {
            let path = inbox.join(format!("f{}.xml", i));
            std::fs::write(&path, format!("<r>{}</r>", i)).unwrap();
            assert!(pool.submit_blocking(path).await);
        }

        pool.stop(Duration::from_secs(10)).await;

        assert_eq!(sink.len(), 4);
        for i in 0..4 {
            assert!(layout.processing().join(format!("f{}.xml", i)).exists());
        }
    }

    #[tokio::test]
    async fn try_submit_reports_full_queue() {
        // No workers started: nothing consumes the queue.
        let pool = WorkerPool::new(1, 2, Arc::new(WatcherMetrics::new()));

        assert_eq!(pool.try_submit("/a".into()), SubmitOutcome::Queued);
        assert_eq!(pool.try_submit("/b".into()), SubmitOutcome::Queued);
        assert_eq!(pool.try_submit("/c".into()), SubmitOutcome::Full);
        assert_eq!(pool.queue_depth(), 2);
    }

    #[tokio::test]
    async fn submissions_after_stop_are_rejected() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();

        let pool = WorkerPool::new(1, 2, Arc::new(WatcherMetrics::new()));
        pool.start(
            pipeline(layout, Arc::new(MemorySink::new())),
            CancellationToken::new(),
        );
        pool.stop(Duration::from_secs(5)).await;

        assert_eq!(pool.try_submit("/late".into()), SubmitOutcome::Closed);
        assert!(!pool.submit_blocking("/late".into()).await);
    }

    #[tokio::test]
    async fn starting_twice_is_harmless() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();

        let sink = Arc::new(MemorySink::new());
        let pool = WorkerPool::new(1, 2, Arc::new(WatcherMetrics::new()));
        let pipeline = pipeline(layout, sink);
        let shutdown = CancellationToken::new();

        pool.start(pipeline.clone(), shutdown.clone());
        pool.start(pipeline, shutdown);

        pool.stop(Duration::from_secs(5)).await;
    }
}
