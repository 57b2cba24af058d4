//! Pattern admission for detected files.
//!
//! Exclude patterns are matched before includes; with no include patterns
//! configured, every non-excluded file passes. Pattern forms:
//!
//! - `*` matches everything
//! - `*.EXT` is a case-insensitive extension match
//! - an exact filename matches itself
//! - anything else is treated as a glob

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Verdict of the admission filter for one basename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The file proceeds into the pipeline.
    Admitted,
    /// An exclude pattern matched.
    Excluded,
    /// Include patterns were configured and none matched.
    NoMatch,
}

/// Classifies a basename against the configured pattern sets.
pub fn admit(filename: &str, includes: &[String], excludes: &[String]) -> Admission {
    for pattern in excludes {
        if match_pattern(filename, pattern) {
            return Admission::Excluded;
        }
    }

    if includes.is_empty() {
        return Admission::Admitted;
    }

    for pattern in includes {
        if match_pattern(filename, pattern) {
            return Admission::Admitted;
        }
    }

    Admission::NoMatch
}

/// Matches a single filename against a single pattern.
pub fn match_pattern(filename: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    // Extension matching (e.g., "*.xml"), case-insensitive.
    if let Some(pattern_ext) = pattern.strip_prefix("*.") {
        return Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(pattern_ext));
    }

    if pattern == filename {
        return true;
    }

    glob::Pattern::new(pattern)
        .map(|p| p.matches(filename))
        .unwrap_or(false)
}

/// Paths that already produced an ignore event.
///
/// The event source emits at-least-once, so the same path can fail
/// admission repeatedly; this set makes the ignored counter increment only
/// on the first sighting. Bounded by process lifetime.
#[derive(Debug, Default)]
pub struct IgnoredPaths {
    inner: Mutex<HashMap<PathBuf, Instant>>,
}

impl IgnoredPaths {
    pub fn new() -> Self {
        IgnoredPaths::default()
    }

    /// Records the path; returns true only the first time it is seen.
    pub fn first_sighting(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(path) {
            false
        } else {
            inner.insert(path.to_path_buf(), Instant::now());
            true
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
