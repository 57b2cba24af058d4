//! Token-bucket admission control.
//!
//! One bucket is shared by every concurrent detection task; its semantics
//! are a global ceiling on files entering the worker pool per second, not a
//! per-worker limit. `try_acquire` is non-blocking: a file that finds no
//! token is diverted, never queued.

use std::sync::Mutex;
use std::time::Instant;

/// Token bucket refilling at `rate` tokens/second with burst capacity equal
/// to the rate.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        let capacity = f64::from(max_per_second.max(1));
        RateLimiter {
            inner: Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_per_sec: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.inner.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
