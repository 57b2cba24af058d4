//! Exponential backoff retry for the publish path.
//!
//! The retry loop wraps a publish thunk, not a sink interface: the circuit
//! breaker composes around it the same way. Cancellation aborts between
//! attempts and surfaces as its own error so callers can distinguish
//! shutdown from a genuinely failing dependency.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Growth factor between retries.
    pub multiplier: f64,
}

impl RetryConfig {
    /// Default publish retry: 3 attempts with 1s, 2s waits, capped at 30s.
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };

    /// Computes the delay after the given attempt (0-indexed).
    ///
    /// Grows as `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Returns all retry delays in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The cancellation token fired between attempts.
    #[error("retry aborted by cancellation")]
    Cancelled,

    /// Every attempt failed; carries the last error.
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

/// Runs `operation` until it succeeds, the attempts are exhausted, or the
/// cancellation token fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    cfg: RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let attempts = cfg.max_attempts.max(1);
    let mut last_error: Option<E> = None;

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }

        // Last attempt: report without waiting.
        if attempt + 1 == attempts {
            break;
        }

        let delay = cfg.delay_for_attempt(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    match last_error {
        Some(source) => Err(RetryError::Exhausted { attempts, source }),
        // Unreachable: the loop runs at least once and either returns or
        // records an error.
        None => Err(RetryError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ─── Unit tests ───────────────────────────────────────────────────────────

    #[test]
    fn default_config_values() {
        let cfg = RetryConfig::DEFAULT;
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_delay, Duration::from_secs(30));
        assert_eq!(cfg.multiplier, 2.0);
    }

    #[test]
    fn default_delays_are_1_2() {
        let delays: Vec<_> = RetryConfig::DEFAULT.delays().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn delays_respect_cap() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(8),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };
        let delays: Vec<_> = cfg.delays().collect();
        assert_eq!(delays[0], Duration::from_secs(8));
        assert_eq!(delays[1], Duration::from_secs(16));
        for delay in &delays[2..] {
            assert_eq!(*delay, Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry_with_backoff(RetryConfig::DEFAULT, &CancellationToken::new(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, SinkError>(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_final_attempt() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry_with_backoff(cfg, &CancellationToken::new(), move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SinkError::Publish("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> =
            retry_with_backoff(cfg, &CancellationToken::new(), move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(SinkError::Publish("down".into())) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let result: Result<(), _> = retry_with_backoff(cfg, &cancel, || async {
            Err(SinkError::Publish("down".into()))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        // With 60s delays, a prompt return proves cancellation short-circuited.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let cfg = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };

        let _ = retry_with_backoff::<(), _, _, _>(cfg, &CancellationToken::new(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(SinkError::Publish("down".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ─── Property tests ───────────────────────────────────────────────────────

    proptest! {
        /// Delays never exceed the cap.
        #[test]
        fn prop_delay_bounded(
            initial_ms in 1u64..1000,
            max_ms in 1000u64..60000,
            multiplier in 1.5f64..3.0,
            attempt in 0u32..12,
        ) {
            let cfg = RetryConfig {
                max_attempts: 12,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
            };
            prop_assert!(cfg.delay_for_attempt(attempt) <= Duration::from_millis(max_ms));
        }

        /// The delay sequence is monotonically non-decreasing.
        #[test]
        fn prop_delays_monotonic(
            initial_ms in 1u64..1000,
            max_ms in 1000u64..60000,
            multiplier in 1.5f64..3.0,
            max_attempts in 2u32..12,
        ) {
            let cfg = RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
            };
            let delays: Vec<_> = cfg.delays().collect();
            for window in delays.windows(2) {
                prop_assert!(window[1] >= window[0]);
            }
        }

        /// The first delay equals the configured initial delay.
        #[test]
        fn prop_first_delay_is_initial(
            initial_ms in 1u64..10_000,
            max_ms in 10_000u64..100_000,
            multiplier in 1.0f64..3.0,
        ) {
            let cfg = RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
            };
            prop_assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(initial_ms));
        }
    }
}
