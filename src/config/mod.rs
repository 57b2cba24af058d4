//! Daemon configuration.
//!
//! Configuration is read from an optional JSON file, then overridden by
//! `GORDON_WATCHER_*` environment variables for the settings that change
//! per deployment. Every field has a default so an empty environment still
//! yields a runnable (memory store, noop sink) daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A setting failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherSettings,
    pub sink: SinkSettings,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub cleanup: CleanupSettings,
}

/// Settings for the core ingestion pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Absolute directories to watch. The first one doubles as the
    /// destination for orphan reconciliation.
    pub paths: Vec<PathBuf>,

    /// Include patterns; empty means match all.
    pub file_patterns: Vec<String>,

    /// Exclude patterns, matched before includes.
    pub exclude_patterns: Vec<String>,

    /// Size bounds in bytes (inclusive minimum, inclusive maximum).
    pub min_file_size: i64,
    pub max_file_size: i64,

    /// Stability probing: maximum probes and delay between them.
    pub stable_attempts: u32,
    pub stable_delay_ms: u64,

    /// Worker pool sizing.
    pub max_workers: usize,
    pub worker_queue_size: usize,

    /// Global admission ceiling in files per second.
    pub max_files_per_second: u32,

    /// Working directory holding the staging subdirectories.
    pub working_dir: PathBuf,
}

impl WatcherSettings {
    pub fn stable_delay(&self) -> Duration {
        Duration::from_millis(self.stable_delay_ms)
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        WatcherSettings {
            paths: vec![PathBuf::from("/opt/gordon-watcher/data/incoming")],
            file_patterns: vec!["*.xml".to_string(), "*.zip".to_string()],
            exclude_patterns: vec![".*".to_string(), "*.tmp".to_string()],
            min_file_size: 100,
            max_file_size: 100 * 1024 * 1024,
            stable_attempts: 5,
            stable_delay_ms: 1_000,
            max_workers: 10,
            worker_queue_size: 10,
            max_files_per_second: 100,
            working_dir: PathBuf::from("/opt/gordon-watcher/data"),
        }
    }
}

/// Which sink implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    Http,
    Memory,
    Noop,
}

/// Settings for the downstream message sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub mode: SinkMode,
    /// Ingest endpoint URL, required for `http`.
    pub endpoint: String,
    pub routing_key: String,
    pub destination: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            mode: SinkMode::Noop,
            endpoint: String::new(),
            routing_key: "files.new".to_string(),
            destination: "file-events".to_string(),
        }
    }
}

/// Which state-store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Memory,
}

/// Settings for the state store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub mode: StoreMode,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            mode: StoreMode::Memory,
        }
    }
}

/// Settings for the probe/metrics HTTP server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

/// Settings for the retention cleaner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    /// Interval between retention passes, in seconds.
    pub interval_secs: u64,
    /// Interval between empty-directory sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Retention in days per staging directory; 0 means never delete.
    /// `tmp/` is always emptied regardless.
    pub retention_processed_days: u32,
    pub retention_failed_days: u32,
    pub retention_ignored_days: u32,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        CleanupSettings {
            enabled: true,
            interval_secs: 24 * 60 * 60,
            sweep_interval_secs: 10 * 60,
            retention_processed_days: 7,
            retention_failed_days: 30,
            retention_ignored_days: 7,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            watcher: WatcherSettings::default(),
            sink: SinkSettings::default(),
            store: StoreSettings::default(),
            server: ServerSettings::default(),
            cleanup: CleanupSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration: file (if present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Applies `GORDON_WATCHER_*` environment overrides for the settings
    /// that vary per deployment.
    fn apply_env(&mut self) {
        if let Ok(paths) = std::env::var("GORDON_WATCHER_PATHS") {
            let parsed: Vec<PathBuf> = paths
                .split(',')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
            if !parsed.is_empty() {
                self.watcher.paths = parsed;
            }
        }
        if let Ok(dir) = std::env::var("GORDON_WATCHER_WORKING_DIR") {
            if !dir.is_empty() {
                self.watcher.working_dir = PathBuf::from(dir);
            }
        }
        if let Ok(workers) = std::env::var("GORDON_WATCHER_MAX_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.watcher.max_workers = n;
            }
        }
        if let Ok(rate) = std::env::var("GORDON_WATCHER_MAX_FILES_PER_SECOND") {
            if let Ok(n) = rate.parse() {
                self.watcher.max_files_per_second = n;
            }
        }
        if let Ok(endpoint) = std::env::var("GORDON_WATCHER_SINK_ENDPOINT") {
            if !endpoint.is_empty() {
                self.sink.endpoint = endpoint;
                self.sink.mode = SinkMode::Http;
            }
        }
        if let Ok(key) = std::env::var("GORDON_WATCHER_SINK_ROUTING_KEY") {
            if !key.is_empty() {
                self.sink.routing_key = key;
            }
        }
        if let Ok(dest) = std::env::var("GORDON_WATCHER_SINK_DESTINATION") {
            if !dest.is_empty() {
                self.sink.destination = dest;
            }
        }
        if let Ok(addr) = std::env::var("GORDON_WATCHER_LISTEN_ADDR") {
            if !addr.is_empty() {
                self.server.listen_addr = addr;
            }
        }
    }

    /// Validates settings that would otherwise fail deep inside startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.paths.is_empty() {
            return Err(ConfigError::Invalid(
                "watcher.paths must have at least one path".to_string(),
            ));
        }
        if self.watcher.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "watcher.max_workers must be greater than 0".to_string(),
            ));
        }
        if self.watcher.max_files_per_second == 0 {
            return Err(ConfigError::Invalid(
                "watcher.max_files_per_second must be greater than 0".to_string(),
            ));
        }
        if self.watcher.worker_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "watcher.worker_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.watcher.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "watcher.working_dir is required".to_string(),
            ));
        }
        if self.watcher.min_file_size < 0 {
            return Err(ConfigError::Invalid(
                "watcher.min_file_size must not be negative".to_string(),
            ));
        }
        if self.watcher.max_file_size < self.watcher.min_file_size {
            return Err(ConfigError::Invalid(
                "watcher.max_file_size must be at least min_file_size".to_string(),
            ));
        }
        if self.sink.mode == SinkMode::Http && self.sink.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sink.endpoint is required when sink.mode is http".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.watcher.stable_attempts, 5);
        assert_eq!(cfg.watcher.stable_delay(), Duration::from_secs(1));
        assert_eq!(cfg.sink.mode, SinkMode::Noop);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "watcher": {
                    "paths": ["/data/inbox"],
                    "max_workers": 4
                },
                "sink": {
                    "mode": "http",
                    "endpoint": "http://broker:9000/publish"
                }
            })
            .to_string(),
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.watcher.paths, vec![PathBuf::from("/data/inbox")]);
        assert_eq!(cfg.watcher.max_workers, 4);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.watcher.max_files_per_second, 100);
        assert_eq!(cfg.sink.mode, SinkMode::Http);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.json")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let result = Config::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validation_rejects_empty_paths() {
        let mut cfg = Config::default();
        cfg.watcher.paths.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_workers() {
        let mut cfg = Config::default();
        cfg.watcher.max_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_size_bounds() {
        let mut cfg = Config::default();
        cfg.watcher.min_file_size = 1_000;
        cfg.watcher.max_file_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_requires_endpoint_for_http_sink() {
        let mut cfg = Config::default();
        cfg.sink.mode = SinkMode::Http;
        cfg.sink.endpoint = String::new();
        assert!(cfg.validate().is_err());
    }
}
