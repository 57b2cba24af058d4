//! Message-sink abstraction and the published message shape.
//!
//! The sink is the second of the two capability seams: a durable topic/queue
//! that accepts JSON payloads. The daemon publishes exactly one message per
//! unique file; everything upstream (retry, circuit breaker) treats the sink
//! as an opaque `publish` that may fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Fingerprint, IngestRecord};

pub mod http;
pub mod memory;

pub use http::HttpSink;
pub use memory::{MemorySink, NoopSink};

/// Errors surfaced by sink operations.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The transport could not deliver the message.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The destination answered with a non-success status.
    #[error("destination rejected message with status {0}")]
    Rejected(u16),

    /// Serializing the message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// The published message. Field set and names are the downstream contract:
///
/// ```json
/// {"id":"<hex-hash>","path":"<staged-absolute>","filename":"<basename>",
///  "kind":"xml","size":200,"hash":"<hex-hash>","timestamp":"<RFC3339>"}
/// ```
///
/// `id` always equals `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMessage {
    pub id: Fingerprint,
    pub path: String,
    pub filename: String,
    pub kind: String,
    pub size: i64,
    pub hash: Fingerprint,
    pub timestamp: DateTime<Utc>,
}

impl FileMessage {
    /// Builds the message for a staged record.
    ///
    /// The record must have been fingerprinted and staged; the staged path is
    /// the one downstream consumers read from.
    pub fn from_record(record: &IngestRecord, fingerprint: &Fingerprint) -> Self {
        let path = record
            .staged_path
            .as_deref()
            .unwrap_or(&record.source_path)
            .to_string_lossy()
            .into_owned();
        FileMessage {
            id: fingerprint.clone(),
            path,
            filename: record.filename(),
            kind: record.kind.clone(),
            size: record.size_bytes,
            hash: fingerprint.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Capability abstraction over the downstream queue.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publishes one message. Success means the destination durably accepted
    /// it.
    async fn publish(&self, msg: &FileMessage) -> Result<()>;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<()>;
}
