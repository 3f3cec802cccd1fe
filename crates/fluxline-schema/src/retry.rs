//! Retry logic with exponential backoff for registry operations.
//!
//! Registration, retrieval, and compatibility checks each run through a
//! [`RetryPolicy`]: transient failures (as classified by
//! [`SchemaError::is_retryable`]) are retried with exponentially growing
//! delays up to a configured cap, permanent failures surface immediately,
//! and exhausting the retry budget surfaces the last error.
//!
//! ## Backoff Calculation
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//!
//! Example with 100ms initial, 2x multiplier, 1s cap:
//! - Retry 1: 100ms
//! - Retry 2: 200ms
//! - Retry 3: 400ms
//! - Retry 4+: capped at 1s
//! ```
//!
//! Each operation kind owns an independently configured policy; the retry
//! budget for registration need not match the budget for compatibility
//! checks.

use crate::error::{Result, SchemaError};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// Immutable once constructed and cheap to clone; one instance is shared
/// across all operations of a kind.
///
/// # Fields
///
/// * `max_retries` - Retries after the initial attempt (default: 3)
/// * `initial_backoff` - First retry delay (default: 100ms)
/// * `max_backoff` - Delay cap (default: 30s)
/// * `backoff_multiplier` - Exponential growth factor (default: 2.0)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with custom settings.
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Calculate the backoff duration for a given attempt number.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Attempt number (0-indexed: attempt 0 is the first retry)
    ///
    /// # Returns
    ///
    /// `min(initial_backoff * multiplier^attempt, max_backoff)`
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }
}

/// Retry an operation with exponential backoff.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `token` - Cancellation signal; firing it aborts promptly with
///   [`SchemaError::Cancelled`], including mid-backoff
/// * `operation` - Async operation to retry
///
/// # Behavior
///
/// 1. Try the operation
/// 2. On success, return the result
/// 3. On a non-retryable error, return it immediately
/// 4. On a retryable error with retries remaining, sleep the backoff and
///    retry
/// 5. After `max_retries` retries, return the last error
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(SchemaError::Cancelled),
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    warn!(error = %err, "Non-retryable error, giving up");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis(),
                    error = %err,
                    "Retryable error, backing off"
                );

                tokio::select! {
                    _ = token.cancelled() => return Err(SchemaError::Cancelled),
                    _ = sleep(backoff) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Retry an operation with jittered exponential backoff.
///
/// Adds random jitter (0.75x to 1.25x) to each backoff duration so that a
/// fleet of clients recovering from the same registry outage does not
/// retry in lockstep.
pub async fn retry_with_jittered_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(SchemaError::Cancelled),
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    warn!(error = %err, "Non-retryable error, giving up");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let base = policy.backoff(attempt);
                let jitter = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
                let jittered = Duration::from_millis((base.as_millis() as f64 * jitter) as u64);

                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = jittered.as_millis(),
                    error = %err,
                    "Retryable error, backing off with jitter"
                );

                tokio::select! {
                    _ = token.cancelled() => return Err(SchemaError::Cancelled),
                    _ = sleep(jittered) => {}
                }
                attempt += 1;
            }
        }
    }
}
