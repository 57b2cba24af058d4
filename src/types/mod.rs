//! Domain types for the ingestion pipeline.
//!
//! These newtypes prevent accidental mixing of raw strings (e.g., using an
//! arbitrary string where a validated fingerprint is expected) and make the
//! pipeline code self-documenting.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing an invalid fingerprint.
#[derive(Debug, Clone, Error)]
#[error("invalid fingerprint: expected 64 hex characters, got {len} bytes: {preview}")]
pub struct InvalidFingerprint {
    len: usize,
    preview: String,
}

/// A content fingerprint: the hex-encoded SHA-256 digest of
/// `basename ++ file_bytes`.
///
/// Including the basename in the preimage is deliberate: two files with
/// identical content but different names are distinct units of work.
///
/// This type guarantees the contained string is exactly 64 lowercase hex
/// characters. Construction goes through [`Fingerprint::parse`] or
/// [`Fingerprint::from_digest`], which validate or produce canonical input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parses a string as a fingerprint, validating that it is exactly
    /// 64 hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidFingerprint> {
        let s = s.into();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            // Normalize to lowercase for consistent comparison
            Ok(Fingerprint(s.to_ascii_lowercase()))
        } else {
            Err(InvalidFingerprint {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Builds a fingerprint from a finished SHA-256 digest.
    pub fn from_digest(digest: sha2::digest::Output<sha2::Sha256>) -> Self {
        Fingerprint(format!("{:x}", digest))
    }

    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (12-character) version for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(s).map_err(serde::de::Error::custom)
    }
}

/// Reason a file was diverted to the `ignored/` staging directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Basename matched an exclude pattern.
    PatternExcluded,
    /// Include patterns were configured and none matched.
    NoMatch,
    /// Size and mtime kept changing across all stability probes,
    /// or the file vanished while probing.
    FileNotStable,
    /// Token bucket had no token available.
    RateLimitExceeded,
    /// The bounded worker queue was full on a non-blocking submission.
    QueueFull,
    /// Below the configured minimum size.
    FileTooSmall,
    /// Above the configured maximum size.
    FileTooLarge,
    /// Fingerprint already recorded as processed within the dedup window.
    Duplicate,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::PatternExcluded => "pattern_excluded",
            IgnoreReason::NoMatch => "no_match",
            IgnoreReason::FileNotStable => "file_not_stable",
            IgnoreReason::RateLimitExceeded => "rate_limit_exceeded",
            IgnoreReason::QueueFull => "queue_full",
            IgnoreReason::FileTooSmall => "file_too_small",
            IgnoreReason::FileTooLarge => "file_too_large",
            IgnoreReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a file was moved to the `failed/` staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The archive could not be expanded (corrupt zip, traversal attempt, IO).
    ZipExtractionFailed,
    /// Publishing to the sink failed after retries, or the breaker was open.
    /// Carries the terminal error's description.
    QueueError(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::ZipExtractionFailed => f.write_str("zip_extraction_failed"),
            FailReason::QueueError(detail) => write!(f, "queue_error:{}", detail),
        }
    }
}

/// Returns the file kind for a path: the lowercased extension without the
/// leading dot, or `"unknown"` when there is none.
pub fn file_kind(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "unknown".to_string(),
    }
}

/// Pipeline position of a single file.
///
/// Transitions are strictly forward; terminal states are `Published`,
/// `Ignored`, and `Failed` (plus deletion for expanded archives).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Detected,
    Stable,
    Admitted,
    Hashed,
    Locked,
    Staged,
    Published,
    Ignored,
    Failed,
}

/// The per-file in-flight record threaded through the ingestion procedure.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    /// Incoming location (inside a watched root).
    pub source_path: PathBuf,
    /// Canonical location after the move into `processing/`.
    pub staged_path: Option<PathBuf>,
    pub size_bytes: i64,
    /// Lowercased extension without dot; `unknown` if none.
    pub kind: String,
    pub fingerprint: Option<Fingerprint>,
    pub state: IngestState,
}

impl IngestRecord {
    pub fn new(source_path: impl Into<PathBuf>, size_bytes: i64) -> Self {
        let source_path = source_path.into();
        let kind = file_kind(&source_path);
        IngestRecord {
            source_path,
            staged_path: None,
            size_bytes,
            kind,
            fingerprint: None,
            state: IngestState::Detected,
        }
    }

    /// Basename of the source path.
    pub fn filename(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_valid_fingerprint() {
        let hex = "a".repeat(64);
        let fp = Fingerprint::parse(&hex).unwrap();
        assert_eq!(fp.as_str(), hex);
    }

    #[test]
    fn parse_normalizes_to_lowercase() {
        let fp = Fingerprint::parse("AB".repeat(32)).unwrap();
        assert_eq!(fp.as_str(), "ab".repeat(32));
    }

    #[test]
    fn parse_rejects_short_input() {
        assert!(Fingerprint::parse("abc123").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert!(Fingerprint::parse("z".repeat(64)).is_err());
    }

    #[test]
    fn short_is_twelve_chars() {
        let fp = Fingerprint::parse("0123456789abcdef".repeat(4)).unwrap();
        assert_eq!(fp.short(), "0123456789ab");
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(file_kind(Path::new("/in/report.XML")), "xml");
        assert_eq!(file_kind(Path::new("/in/pack.zip")), "zip");
        assert_eq!(file_kind(Path::new("/in/README")), "unknown");
        assert_eq!(file_kind(Path::new("/in/archive.tar.gz")), "gz");
    }

    #[test]
    fn ignore_reasons_render_as_snake_case() {
        assert_eq!(IgnoreReason::PatternExcluded.as_str(), "pattern_excluded");
        assert_eq!(IgnoreReason::RateLimitExceeded.as_str(), "rate_limit_exceeded");
        assert_eq!(IgnoreReason::Duplicate.as_str(), "duplicate");
    }

    #[test]
    fn fail_reason_carries_detail() {
        let reason = FailReason::QueueError("publish timed out".into());
        assert_eq!(reason.to_string(), "queue_error:publish timed out");
        assert_eq!(
            FailReason::ZipExtractionFailed.to_string(),
            "zip_extraction_failed"
        );
    }

    #[test]
    fn record_derives_kind_and_filename() {
        let record = IngestRecord::new("/inbox/a.XML", 200);
        assert_eq!(record.kind, "xml");
        assert_eq!(record.filename(), "a.XML");
        assert_eq!(record.state, IngestState::Detected);
        assert!(record.staged_path.is_none());
    }

    proptest! {
        /// Any 64-char hex string round-trips through parse/as_str.
        #[test]
        fn prop_fingerprint_roundtrip(hex in "[0-9a-f]{64}") {
            let fp = Fingerprint::parse(&hex).unwrap();
            prop_assert_eq!(fp.as_str(), hex.as_str());
        }

        /// Serde round-trip preserves the fingerprint.
        #[test]
        fn prop_fingerprint_serde_roundtrip(hex in "[0-9a-f]{64}") {
            let fp = Fingerprint::parse(&hex).unwrap();
            let json = serde_json::to_string(&fp).unwrap();
            let back: Fingerprint = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(fp, back);
        }

        /// Wrong-length strings never parse.
        #[test]
        fn prop_wrong_length_rejected(hex in "[0-9a-f]{0,63}") {
            prop_assert!(Fingerprint::parse(&hex).is_err());
        }
    }
}
