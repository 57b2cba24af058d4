//! Directory supervisor.
//!
//! Container restarts and network-share remounts can remove the staging
//! subdirectories out from under a running daemon. A periodic check
//! recreates any that went missing.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::fsops::{self, StagingLayout};

/// How often the staging directories are verified.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runs the supervision loop until the shutdown token fires.
///
/// The first verification happens immediately on start.
pub async fn run(layout: StagingLayout, shutdown: CancellationToken) {
    run_with_interval(layout, shutdown, CHECK_INTERVAL).await;
}

pub(crate) async fn run_with_interval(
    layout: StagingLayout,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            // The first tick completes immediately.
            _ = ticker.tick() => ensure_directories(&layout),
        }
    }
}

/// Recreates any missing staging subdirectory with mode `0755`.
fn ensure_directories(layout: &StagingLayout) {
    for dir in layout.staging_dirs() {
        if dir.is_dir() {
            continue;
        }
        warn!(path = %dir.display(), "Directory missing, recreating");
        match fsops::ensure_dir(&dir) {
            Ok(()) => info!(path = %dir.display(), "Directory recreated"),
            Err(e) => error!(path = %dir.display(), error = %e, "Failed to recreate directory"),
        }
    }
}
