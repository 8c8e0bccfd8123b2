//! Bounded retry with backoff.
//!
//! Used by the durable writer to ride out SQLite lock contention. Attempts run
//! on the calling thread with synchronous sleeps in between; async callers
//! wrap the whole loop in `spawn_blocking`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use airlab_core::retry::{RetryPolicy, is_retryable, with_retry_blocking};
//!
//! let policy = RetryPolicy::db_write();
//! let outcome = with_retry_blocking(&policy, is_retryable, |_attempt| store.try_insert(&reading));
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result, StorageError};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `initial * (n + 1)`: 0.5s, 1.0s, 1.5s, ...
    Linear,
    /// `initial * factor^n`
    Exponential { factor: u32 },
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Delay growth.
    pub backoff: Backoff,
    /// Random jitter range as percentage (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::db_write()
    }
}

impl RetryPolicy {
    /// Policy for reading inserts: 3 attempts, linear 500ms steps, no jitter.
    #[must_use]
    pub fn db_write() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Linear,
            jitter_percent: 0.0,
            max_attempts: 3,
        }
    }

    /// Linear policy with the given step and attempt budget.
    #[must_use]
    pub fn linear(step: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: step,
            max_delay: step.saturating_mul(max_attempts.max(1)),
            backoff: Backoff::Linear,
            jitter_percent: 0.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let base_ms = match self.backoff {
            Backoff::Linear => initial_ms.saturating_mul(u64::from(attempt) + 1),
            Backoff::Exponential { factor } => {
                // 2^31 steps is already far past any sane max_delay
                let exp = attempt.min(31);
                initial_ms.saturating_mul(u64::from(factor.max(1)).saturating_pow(exp))
            }
        }
        .min(max_ms);

        let jitter = if self.jitter_percent > 0.0 {
            let range = base_ms as f64 * self.jitter_percent.clamp(0.0, 1.0);
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms as f64 + jitter).max(0.0) as u64)
    }
}

/// Outcome of a retry loop.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Whether an error is worth another attempt.
///
/// Only lock contention is transient; structural, permission and capacity
/// failures propagate on first sight.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Storage(StorageError::Busy(_)))
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The closure receives the 1-based attempt number.
pub fn with_retry_blocking<T, F, R>(
    policy: &RetryPolicy,
    retryable: R,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Result<T>,
    R: Fn(&Error) -> bool,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        total_attempts = attempt,
                        retries = attempt - 1,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                if !retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if attempt >= max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Database locked, retrying ({attempt}/{max_attempts})"
                );
                std::thread::sleep(delay);
            }
        }
    }
}
