//! Bounded retry with multiplicative backoff.
//!
//! [`RetryPolicy`] wraps any async operation. It re-runs the operation up to
//! `retries` additional times on any error, sleeping between attempts with a
//! delay that grows by `factor` each time, and returns the final error once
//! the budget is spent. Each call to [`RetryPolicy::run`] is independent.

use std::future::Future;
use std::time::Duration;

/// Default number of additional attempts.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default backoff multiplier (doubles each attempt).
pub const DEFAULT_FACTOR: u32 = 2;

/// Delay before the first retry.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    factor: u32,
    initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            factor: DEFAULT_FACTOR,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, factor: u32) -> Self {
        Self {
            retries,
            factor: factor.max(1),
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay slept after the `attempt`-th failure (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(multiplier)
    }

    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(op, |_, _, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, &error, delay)`
    /// before each backoff sleep.
    pub async fn run_with<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E, Duration),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt > self.retries => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    on_retry(attempt, &e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
