//! Bounded retry with exponential backoff for single remote calls.

use crate::errors::ApiError;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt budget and backoff shape for one remote call.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt. Doubles on every further failure.
    pub initial_backoff_ms: u64,
    /// Hard cap on a single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Shifts of 64 or more saturate instead of overflowing.
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, PartialEq)]
pub enum RetryError {
    /// The last error seen, either non-retryable or after the budget ran out.
    Failed { error: ApiError, attempts: u32 },
    Cancelled,
}

/// Runs `operation` until it succeeds, fails with an error `should_retry` rejects,
/// or the attempt budget is exhausted. Cancellation aborts immediately, including
/// an in-flight attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    should_retry: impl Fn(&ApiError) -> bool,
    operation: F,
) -> Result<T, RetryError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        attempt += 1;
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(RetryError::Failed {
                error,
                attempts: attempt,
            });
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient error"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
