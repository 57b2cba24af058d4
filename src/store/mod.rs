//! State-store abstraction for idempotency tracking and distributed locks.
//!
//! The store is a key/value surface with expiring keys and compare-and-set
//! semantics. It records three facts per fingerprint (`enqueued`,
//! `processed`, `failed`) and holds short-lived locks that serialize the
//! move-and-publish region across workers cluster-wide.
//!
//! # Key layout
//!
//! All keys carry the `gordon:watcher:` prefix:
//!
//! - `gordon:watcher:processed:<hash>` - dedup window, 7-day TTL
//! - `gordon:watcher:enqueued:<hash>`  - in-flight marker, 24-hour TTL
//! - `gordon:watcher:failed:<hash>`    - terminal failure record, 7-day TTL
//! - `gordon:watcher:lock:<hash>`      - owner token, 30-second TTL
//!
//! Lock release is a compare-and-delete: only the holder of the owner token
//! may remove the key, so a worker that lost its lock to TTL expiry cannot
//! release a successor's lock.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Fingerprint;

pub mod memory;

pub use memory::MemoryStore;

/// Common prefix for every key the daemon writes.
pub const KEY_PREFIX: &str = "gordon:watcher:";

/// TTL for `enqueued` entries: bounds storage leakage if downstream never
/// acknowledges.
pub const ENQUEUED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for `processed` and `failed` entries: the deduplication window.
pub const PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// TTL for fingerprint locks.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// Builds the `processed` key for a fingerprint.
pub fn processed_key(fingerprint: &Fingerprint) -> String {
    format!("{}processed:{}", KEY_PREFIX, fingerprint)
}

/// Builds the `enqueued` key for a fingerprint.
pub fn enqueued_key(fingerprint: &Fingerprint) -> String {
    format!("{}enqueued:{}", KEY_PREFIX, fingerprint)
}

/// Builds the `failed` key for a fingerprint.
pub fn failed_key(fingerprint: &Fingerprint) -> String {
    format!("{}failed:{}", KEY_PREFIX, fingerprint)
}

/// Builds the `lock` key for a fingerprint.
pub fn lock_key(fingerprint: &Fingerprint) -> String {
    format!("{}lock:{}", KEY_PREFIX, fingerprint)
}

/// Errors surfaced by state-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The lock for this fingerprint is held by another owner.
    #[error("lock already held")]
    LockHeld,

    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Opaque owner token for a held lock.
///
/// The token is the value stored under the lock key; release compares it
/// before deleting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(s: impl Into<String>) -> Self {
        LockToken(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Capability abstraction over the remote (or in-memory) state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns true if the fingerprint is inside the dedup window.
    async fn is_processed(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Records that a file with this fingerprint was staged and published.
    async fn mark_enqueued(&self, fingerprint: &Fingerprint, path: &Path) -> Result<()>;

    /// Moves the fingerprint into the dedup window and clears its
    /// `enqueued` entry. Called by the downstream consumer once it has
    /// finished with the staged file.
    async fn mark_processed(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Records a terminal failure for the fingerprint and clears its
    /// `enqueued` entry.
    async fn mark_failed(&self, fingerprint: &Fingerprint, reason: &str) -> Result<()>;

    /// Attempts to acquire the fingerprint lock.
    ///
    /// Returns [`StoreError::LockHeld`] when another owner holds a live
    /// lock; any other error means the backend could not be reached.
    async fn try_lock(&self, fingerprint: &Fingerprint) -> Result<LockToken>;

    /// Releases a held lock. The delete only happens when the stored value
    /// still equals `token`.
    async fn release_lock(&self, fingerprint: &Fingerprint, token: &LockToken) -> Result<()>;

    /// Closes the backend connection.
    async fn close(&self) -> Result<()>;
}
