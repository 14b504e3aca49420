//! Explicit retry-with-backoff policy.
//!
//! Every call site that talks to something slow or flaky (the repository,
//! the resolution agent) receives a [`RetryPolicy`] value instead of relying
//! on hidden constants.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff and a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            timeout,
        }
    }

    /// A policy that tries exactly once.
    pub fn once(timeout: Duration) -> Self {
        Self::new(1, Duration::ZERO, timeout)
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted.
    ///
    /// Each attempt is bounded by `timeout`; an expired attempt is turned
    /// into an error with `on_timeout` and treated as retryable.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut f: F,
        on_timeout: impl Fn() -> E,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let (err, retryable) = match tokio::time::timeout(self.timeout, f(attempt)).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    let retryable = is_retryable(&e);
                    (e, retryable)
                }
                Err(_) => (on_timeout(), true),
            };

            if !retryable || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(30))
    }
}
