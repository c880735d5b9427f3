//! Retry utilities for waiting on asynchronous controller reconciliation.
//!
//! Two strategies are provided:
//!
//! - [`Retry::constant`] polls a check at a fixed interval until it succeeds or
//!   a deadline passes. The check classifies its failures: an
//!   [`RetryError::Expected`] means "not converged yet, poll again", while an
//!   [`RetryError::Unexpected`] aborts the wait immediately.
//! - [`retry_with_backoff`] retries a transiently failing operation with
//!   exponential backoff and jitter.
//!
//! # Example
//!
//! ```ignore
//! use sfyra::retry::{Retry, RetryError};
//!
//! Retry::constant(Duration::from_secs(300), Duration::from_secs(10))
//!     .retry("servers to register", || async {
//!         let servers = api.list(&ListParams::default()).await.map_err(RetryError::unexpected)?;
//!         if servers.items.len() != expected {
//!             return Err(RetryError::expected(Error::assertion(format!("{} != {}", servers.items.len(), expected))));
//!         }
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Failure classification returned by a polled check.
#[derive(Debug)]
pub enum RetryError {
    /// The condition is not met yet; keep polling.
    Expected(Error),
    /// Something is broken; stop polling and return the error.
    Unexpected(Error),
}

impl RetryError {
    /// Wrap a "not ready yet" reason.
    pub fn expected(err: impl Into<Error>) -> Self {
        Self::Expected(err.into())
    }

    /// Wrap a fatal error.
    pub fn unexpected(err: impl Into<Error>) -> Self {
        Self::Unexpected(err.into())
    }
}

/// Fixed-interval polling with an overall timeout.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    timeout: Duration,
    interval: Duration,
}

impl Retry {
    /// Poll every `interval` until `timeout` has elapsed.
    pub fn constant(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Overall deadline for the wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay between attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `check` until it returns `Ok`, an unexpected error, or time runs out.
    ///
    /// The check always runs at least once. On timeout the returned
    /// [`Error::Timeout`] carries the last expected failure.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut check: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RetryError>>,
    {
        let start = Instant::now();

        loop {
            match check().await {
                Ok(value) => return Ok(value),
                Err(RetryError::Unexpected(e)) => {
                    error!(operation = %operation, error = %e, "Unexpected error while waiting");
                    return Err(e);
                }
                Err(RetryError::Expected(e)) => {
                    let elapsed = start.elapsed();
                    if elapsed + self.interval > self.timeout {
                        return Err(Error::timeout(operation, e.to_string()));
                    }

                    debug!(
                        operation = %operation,
                        reason = %e,
                        elapsed_secs = elapsed.as_secs(),
                        "Waiting..."
                    );
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

/// Bounded exponential backoff for transient API writes.
///
/// The delay doubles after every failure up to `max_delay`, with 0.5x-1.5x
/// jitter applied to each sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// Try at most `attempts` times (at least once)
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Override the first and the largest delay
    pub fn with_delays(self, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..self
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `backoff` runs out of attempts;
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = backoff.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if attempt >= backoff.attempts {
            error!(operation = %operation_name, attempt, error = %err, "Giving up");
            return Err(err);
        }

        let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "Transient failure, retrying"
        );
        tokio::time::sleep(jittered).await;
        delay = backoff.next_delay(delay);
    }
}
