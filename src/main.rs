//! Gordon Watcher - main entry point.
//!
//! This binary wires the ingestion pipeline to its collaborators (state
//! store, message sink, probe server), runs until SIGINT/SIGTERM, and
//! shuts down gracefully. Exit code 0 on an orderly stop; 1 on a
//! start-time failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gordon_watcher::config::{Config, SinkMode, StoreMode};
use gordon_watcher::metrics::WatcherMetrics;
use gordon_watcher::server::{AppState, build_router};
use gordon_watcher::sink::{HttpSink, MemorySink, MessageSink, NoopSink, http::HttpSinkConfig};
use gordon_watcher::store::{MemoryStore, StateStore};
use gordon_watcher::watcher::Watcher;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gordon_watcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load and validate configuration. Either failure is fatal.
    let config_path = std::env::var("GORDON_WATCHER_CONFIG")
        .ok()
        .map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    info!(
        paths = ?config.watcher.paths,
        working_dir = %config.watcher.working_dir.display(),
        workers = config.watcher.max_workers,
        "Starting Gordon Watcher"
    );

    let metrics = Arc::new(WatcherMetrics::new());

    let store: Arc<dyn StateStore> = match config.store.mode {
        StoreMode::Memory => {
            info!("Memory state store initialized");
            Arc::new(MemoryStore::new())
        }
    };

    let sink: Arc<dyn MessageSink> = match config.sink.mode {
        SinkMode::Http => {
            let sink_cfg = HttpSinkConfig {
                endpoint: config.sink.endpoint.clone(),
                routing_key: config.sink.routing_key.clone(),
                destination: config.sink.destination.clone(),
            };
            match HttpSink::new(sink_cfg) {
                Ok(sink) => {
                    info!(
                        endpoint = %config.sink.endpoint,
                        destination = %config.sink.destination,
                        "HTTP sink initialized"
                    );
                    Arc::new(sink)
                }
                Err(e) => {
                    error!(error = %e, "Failed to initialize HTTP sink, falling back to noop");
                    Arc::new(NoopSink::new())
                }
            }
        }
        SinkMode::Memory => {
            info!("Memory sink initialized");
            Arc::new(MemorySink::new())
        }
        SinkMode::Noop => {
            info!("Noop sink initialized (sink disabled)");
            Arc::new(NoopSink::new())
        }
    };

    let watcher = match Watcher::new(
        config.watcher.clone(),
        config.cleanup.clone(),
        store,
        sink,
        metrics.clone(),
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(error = %e, "Failed to create watcher");
            std::process::exit(1);
        }
    };

    // Probe/metrics server; readiness flips on once the watcher is up.
    let ready = Arc::new(AtomicBool::new(false));
    let app = build_router(AppState::new(metrics.clone(), ready.clone()));
    let listener = match tokio::net::TcpListener::bind(&config.server.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.server.listen_addr, error = %e, "Failed to bind server address");
            std::process::exit(1);
        }
    };
    info!(addr = %config.server.listen_addr, "Probe server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Probe server failed");
        }
    });

    if let Err(e) = watcher.start().await {
        error!(error = %e, "Failed to start watcher");
        std::process::exit(1);
    }
    ready.store(true, Ordering::Relaxed);
    info!("Gordon Watcher started successfully");

    // Wait for a termination signal.
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::process::exit(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    ready.store(false, Ordering::Relaxed);
    info!("Shutting down gracefully");

    watcher.stop().await;

    info!("Gordon Watcher stopped");
}
