//! Process-wide observability counters for the ingestion pipeline.
//!
//! `WatcherMetrics` is an observer handle passed through component
//! constructors rather than reached for as ambient state, which keeps tests
//! hermetic: each test builds its own instance and asserts on a snapshot.
//!
//! Rendering follows the Prometheus text exposition format so the `/metrics`
//! endpoint can serve the handle directly.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A histogram with exponential buckets.
///
/// Observations are per-file events, so a mutex around the bucket array is
/// cheap; the hot counters above stay lock-free.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    inner: Mutex<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    /// Creates a histogram with `count` exponential buckets starting at
    /// `start` with the given growth `factor`.
    pub fn exponential(start: f64, factor: f64, count: usize) -> Self {
        let mut bounds = Vec::with_capacity(count);
        let mut bound = start;
        for _ in 0..count {
            bounds.push(bound);
            bound *= factor;
        }
        let buckets = vec![0; count];
        Histogram {
            bounds,
            inner: Mutex::new(HistogramInner {
                buckets,
                count: 0,
                sum: 0.0,
            }),
        }
    }

    pub fn observe(&self, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.count += 1;
        inner.sum += value;
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                inner.buckets[i] += 1;
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    pub fn sum(&self) -> f64 {
        self.inner.lock().unwrap().sum
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        use std::fmt::Write;

        let inner = self.inner.lock().unwrap();
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for (bound, cumulative) in self.bounds.iter().zip(inner.buckets.iter()) {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, bound, cumulative);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, inner.count);
        let _ = writeln!(out, "{}_sum {}", name, inner.sum);
        let _ = writeln!(out, "{}_count {}", name, inner.count);
    }
}

/// The full set of counters, gauges, and histograms the pipeline emits.
///
/// Metric names carry the `gordon_watcher_` prefix expected by the
/// deployment's scrape configuration.
#[derive(Debug)]
pub struct WatcherMetrics {
    // Files
    pub files_detected: Counter,
    pub files_sent: Counter,
    pub files_processed: Counter,
    pub files_duplicated: Counter,
    pub files_rejected: Counter,
    pub files_ignored: Counter,

    // Errors
    pub watcher_errors: Counter,
    pub queue_errors: Counter,
    pub storage_errors: Counter,

    // Rate limiting
    pub rate_limit_waits: Counter,
    pub rate_limit_dropped: Counter,

    // Cleanup
    pub empty_directories_removed: Counter,

    // Worker pool
    pub worker_pool_queue_size: Gauge,
    pub worker_pool_active_workers: Gauge,

    // Runtime
    pub tasks: Gauge,

    // Timings and sizes
    pub file_processing_seconds: Histogram,
    pub file_stability_seconds: Histogram,
    pub file_size_bytes: Histogram,
}

impl WatcherMetrics {
    pub fn new() -> Self {
        WatcherMetrics {
            files_detected: Counter::default(),
            files_sent: Counter::default(),
            files_processed: Counter::default(),
            files_duplicated: Counter::default(),
            files_rejected: Counter::default(),
            files_ignored: Counter::default(),
            watcher_errors: Counter::default(),
            queue_errors: Counter::default(),
            storage_errors: Counter::default(),
            rate_limit_waits: Counter::default(),
            rate_limit_dropped: Counter::default(),
            empty_directories_removed: Counter::default(),
            worker_pool_queue_size: Gauge::default(),
            worker_pool_active_workers: Gauge::default(),
            tasks: Gauge::default(),
            file_processing_seconds: Histogram::exponential(0.001, 2.0, 15),
            file_stability_seconds: Histogram::exponential(0.1, 2.0, 10),
            file_size_bytes: Histogram::exponential(1024.0, 2.0, 15),
        }
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            (
                "gordon_watcher_files_detected_total",
                "Total number of files detected",
                &self.files_detected,
            ),
            (
                "gordon_watcher_files_sent_total",
                "Total number of files sent to the sink",
                &self.files_sent,
            ),
            (
                "gordon_watcher_files_processed_total",
                "Total number of files successfully processed",
                &self.files_processed,
            ),
            (
                "gordon_watcher_files_duplicated_total",
                "Total number of duplicated files (already processed)",
                &self.files_duplicated,
            ),
            (
                "gordon_watcher_files_rejected_total",
                "Total number of rejected files",
                &self.files_rejected,
            ),
            (
                "gordon_watcher_files_ignored_total",
                "Total number of ignored files",
                &self.files_ignored,
            ),
            (
                "gordon_watcher_errors_total",
                "Total number of watcher errors",
                &self.watcher_errors,
            ),
            (
                "gordon_watcher_queue_errors_total",
                "Total number of sink publishing errors",
                &self.queue_errors,
            ),
            (
                "gordon_watcher_storage_errors_total",
                "Total number of state-store errors",
                &self.storage_errors,
            ),
            (
                "gordon_watcher_rate_limit_waits_total",
                "Number of times the rate limiter caused a wait",
                &self.rate_limit_waits,
            ),
            (
                "gordon_watcher_rate_limit_dropped_total",
                "Number of files dropped due to rate limiting or a full queue",
                &self.rate_limit_dropped,
            ),
            (
                "gordon_watcher_empty_directories_removed_total",
                "Total number of empty directories removed",
                &self.empty_directories_removed,
            ),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, &Gauge); 3] = [
            (
                "gordon_watcher_worker_pool_queue_size",
                "Current size of the worker pool queue",
                &self.worker_pool_queue_size,
            ),
            (
                "gordon_watcher_worker_pool_active_workers",
                "Number of workers currently processing files",
                &self.worker_pool_active_workers,
            ),
            (
                "gordon_watcher_tasks",
                "Current number of tracked tasks",
                &self.tasks,
            ),
        ];

        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        self.file_processing_seconds.render(
            &mut out,
            "gordon_watcher_file_processing_seconds",
            "Time taken to process a file",
        );
        self.file_stability_seconds.render(
            &mut out,
            "gordon_watcher_file_stability_seconds",
            "Time taken for a file to stabilize",
        );
        self.file_size_bytes.render(
            &mut out,
            "gordon_watcher_file_size_bytes",
            "Size of detected files in bytes",
        );

        out
    }
}

impl Default for WatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}
