//! In-memory state store with TTL-expiring keys.
//!
//! Behaves like the remote store it stands in for: every entry lives under
//! its fully prefixed key with an expiry deadline, lock acquisition is a
//! compare-and-set on absence, and release is a compare-and-delete on the
//! owner token. Expiry is enforced lazily at read/write time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use crate::types::Fingerprint;

use super::{
    ENQUEUED_TTL, LOCK_TTL, LockToken, PROCESSED_TTL, Result, StateStore, enqueued_key,
    failed_key, lock_key, processed_key,
};

/// Counter feeding lock-token uniqueness within a process.
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory implementation of [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn set(&self, key: String, value: String, ttl: std::time::Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Generates an owner token unique across concurrent acquisitions.
    fn next_token() -> LockToken {
        let pid = std::process::id();
        let counter = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        LockToken::new(format!("{}-{}", pid, counter))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn is_processed(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.get(&processed_key(fingerprint)).is_some())
    }

    async fn mark_enqueued(&self, fingerprint: &Fingerprint, path: &Path) -> Result<()> {
        self.set(
            enqueued_key(fingerprint),
            path.to_string_lossy().into_owned(),
            ENQUEUED_TTL,
        );
        Ok(())
    }

    async fn mark_processed(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.set(
            processed_key(fingerprint),
            chrono::Utc::now().to_rfc3339(),
            PROCESSED_TTL,
        );
        self.delete(&enqueued_key(fingerprint));
        Ok(())
    }

    async fn mark_failed(&self, fingerprint: &Fingerprint, reason: &str) -> Result<()> {
        self.set(
            failed_key(fingerprint),
            format!("{}:{}", chrono::Utc::now().to_rfc3339(), reason),
            PROCESSED_TTL,
        );
        self.delete(&enqueued_key(fingerprint));
        Ok(())
    }

    async fn try_lock(&self, fingerprint: &Fingerprint) -> Result<LockToken> {
        let key = lock_key(fingerprint);
        let token = Self::next_token();

        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get(&key) {
            Some(entry) if entry.live(now) => Err(super::StoreError::LockHeld),
            _ => {
                entries.insert(
                    key,
                    Entry {
                        value: token.as_str().to_string(),
                        expires_at: now + LOCK_TTL,
                    },
                );
                Ok(token)
            }
        }
    }

    async fn release_lock(&self, fingerprint: &Fingerprint, token: &LockToken) -> Result<()> {
        let key = lock_key(fingerprint);

        // Compare-and-delete: only the owner's token removes the key.
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&key) {
            if entry.value == token.as_str() {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
