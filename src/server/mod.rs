//! HTTP server for probes and metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status with uptime (load balancers, dashboards)
//! - `GET /ready` - 200 once the watcher is running, 503 otherwise
//! - `GET /live` - 200 while the process is up (liveness probes)
//! - `GET /metrics` - Prometheus text exposition

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::WatcherMetrics;

/// Shared application state, passed to handlers via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    metrics: Arc<WatcherMetrics>,
    ready: Arc<AtomicBool>,
    started_at: Instant,
}

impl AppState {
    pub fn new(metrics: Arc<WatcherMetrics>, ready: Arc<AtomicBool>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                metrics,
                ready,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }
}

/// Health payload returned by `/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Builds the axum router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        uptime_secs: state.inner.started_at.elapsed().as_secs(),
    })
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn live_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "alive")
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.inner.metrics.render_prometheus(),
    )
}
