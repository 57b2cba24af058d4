//! Three-state circuit breaker guarding the publish path.
//!
//! After `max_failures` consecutive failures the breaker opens and callers
//! fail fast without touching the dependency. Once `reset_timeout` has
//! passed since the last failure, the next call becomes a half-open trial:
//! success closes the breaker, failure re-opens it and restarts the timer.
//!
//! The breaker takes a publish thunk; state lives behind a mutex that is
//! never held across an await.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// The next call is a trial.
    HalfOpen,
}

/// Error returned from a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + 'static,
{
    /// The breaker was open; the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Shared circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            max_failures,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// When open and the reset timeout has not elapsed, returns
    /// [`BreakerError::Open`] without calling the operation.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let trial = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == BreakerState::Open {
                let elapsed_reset = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() > self.reset_timeout);
                if elapsed_reset {
                    inner.state = BreakerState::HalfOpen;
                    inner.failures = 0;
                } else {
                    return Err(BreakerError::Open);
                }
            }
            inner.state == BreakerState::HalfOpen
        };

        let result = operation().await;

        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(value) => {
                if inner.state == BreakerState::HalfOpen {
                    inner.state = BreakerState::Closed;
                }
                inner.failures = 0;
                Ok(value)
            }
            Err(e) => {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                // A failed trial re-opens immediately; otherwise the breaker
                // opens once the consecutive-failure threshold is reached.
                if trial || inner.failures >= self.max_failures {
                    inner.state = BreakerState::Open;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Current breaker position.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Current consecutive-failure count.
    pub fn failures(&self) -> u32 {
        self.inner.lock().unwrap().failures
    }
}
