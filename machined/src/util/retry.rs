//! Retry loops with a total timeout.
//!
//! The closure classifies every failure: [`RetryError::Expected`] is retried
//! until the deadline, [`RetryError::Unexpected`] aborts immediately.

use machined_shared::{MachinedError, MachinedResult};
use std::future::Future;
use std::time::{Duration, Instant};

/// Failure classification for one attempt.
#[derive(Debug)]
pub enum RetryError {
    Expected(MachinedError),
    Unexpected(MachinedError),
}

pub fn expected(err: impl Into<MachinedError>) -> RetryError {
    RetryError::Expected(err.into())
}

pub fn unexpected(err: impl Into<MachinedError>) -> RetryError {
    RetryError::Unexpected(err.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Constant,
    Exponential,
}

/// Retry policy.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    timeout: Duration,
    interval: Duration,
    backoff: Backoff,
}

impl Retry {
    /// Retry every `interval` until `timeout` elapses.
    pub fn constant(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: Backoff::Constant,
        }
    }

    /// Retry with a delay doubling from `base` until `timeout` elapses.
    pub fn exponential(timeout: Duration, base: Duration) -> Self {
        Self {
            timeout,
            interval: base,
            backoff: Backoff::Exponential,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn delay(&self, attempt: u32, remaining: Duration) -> Duration {
        let delay = match self.backoff {
            Backoff::Constant => self.interval,
            Backoff::Exponential => self
                .interval
                .checked_mul(1u32 << attempt.min(16))
                .unwrap_or(self.timeout),
        };
        delay.min(remaining)
    }

    fn timed_out(&self, last: MachinedError) -> MachinedError {
        MachinedError::Timeout(format!("gave up after {:?}: {}", self.timeout, last))
    }

    /// Run a blocking closure under this policy.
    pub fn retry<T, F>(&self, mut f: F) -> MachinedResult<T>
    where
        F: FnMut() -> Result<T, RetryError>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(RetryError::Unexpected(err)) => return Err(err),
                Err(RetryError::Expected(err)) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.timeout {
                        return Err(self.timed_out(err));
                    }
                    tracing::trace!(attempt, error = %err, "Retrying after expected error");
                    std::thread::sleep(self.delay(attempt, self.timeout - elapsed));
                    attempt += 1;
                }
            }
        }
    }

    /// Run an async closure under this policy.
    pub async fn retry_async<T, F, Fut>(&self, mut f: F) -> MachinedResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RetryError>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(RetryError::Unexpected(err)) => return Err(err),
                Err(RetryError::Expected(err)) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.timeout {
                        return Err(self.timed_out(err));
                    }
                    tracing::trace!(attempt, error = %err, "Retrying after expected error");
                    tokio::time::sleep(self.delay(attempt, self.timeout - elapsed)).await;
                    attempt += 1;
                }
            }
        }
    }
}
