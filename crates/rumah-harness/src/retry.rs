//! Bounded retry with exponential backoff.
//!
//! One helper serves every retry site: the fetcher (keyed on HTTP status)
//! and the pipeline's storage retries (keyed on `StorageError` kind). The
//! caller supplies a classifier that turns each error into a
//! [`RetryDecision`].
//!
//! Delay before retry *n* (1-based) is `base_delay × 2^(n-1)`, capped at
//! `max_delay`. A server-provided delay (`Retry-After`) raises the delay
//! for that retry, within the same cap.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// How to treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Retry, waiting at least this long.
    RetryAfter(Duration),
    GiveUp,
}

/// Why [`retry_with_backoff`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// The classifier declared the error not retryable.
    Permanent(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = match classify(&err) {
            RetryDecision::GiveUp => return Err(RetryFailure::Permanent(err)),
            RetryDecision::Retry => policy.delay_for(attempt),
            RetryDecision::RetryAfter(hint) => {
                policy.delay_for(attempt).max(hint).min(policy.max_delay)
            }
        };

        if attempt >= policy.max_attempts {
            return Err(RetryFailure::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
