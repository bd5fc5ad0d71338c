//! Retry with exponential backoff.
//!
//! A single [`RetryPolicy`] is reused by both halves of the failure story:
//! bounded retry around publish attempts and reconnects requested per call
//! via [`RetrySpec`], and the unbounded retry loop the connection pool runs
//! in the background after a mid-session drop.
//!
//! ## Backoff calculation
//!
//! ```text
//! backoff(attempt) = min(min_timeout * factor^(attempt - 1), max_timeout)
//!
//! Defaults (retries: 10, min_timeout: 1s, factor: 2.0, max_timeout: 60s):
//! - Attempt 1 fails: wait 1s
//! - Attempt 2 fails: wait 2s
//! - Attempt 3 fails: wait 4s
//! - ...
//! - Attempt 11 fails: RetriesExhausted
//! ```
//!
//! With `retries = r` the operation is attempted exactly `r + 1` times; once
//! the budget is spent the last error is returned wrapped as
//! [`ClientError::RetriesExhausted`]. Backoff is deterministic unless
//! `randomize` is set, which scales each delay by 0.75–1.25 to spread
//! simultaneous retriers.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Exponential-backoff retry configuration.
///
/// Immutable once an operation begins. The [`Default`] values give a budget
/// of several minutes (1s + 2s + ... capped at 60s over 10 retries), which is
/// what callers opt into with the [`RetrySpec::Defaults`] shorthand.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (total attempts = retries + 1).
    pub retries: u32,

    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,

    /// Delay before the first retry.
    pub min_timeout: Duration,

    /// Cap on any single delay.
    pub max_timeout: Duration,

    /// Scale each delay by a random 0.75–1.25 factor.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            factor: 2.0,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(60),
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom bounds and deterministic backoff.
    pub fn new(retries: u32, factor: f64, min_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            retries,
            factor,
            min_timeout,
            max_timeout,
            randomize: false,
        }
    }

    /// Backoff delay after the given failed attempt (attempts count from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(exp as i32);
        let base = Duration::from_millis(millis as u64).min(self.max_timeout);
        if self.randomize {
            let jitter = 0.75 + (rand::random::<f64>() * 0.5);
            Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
        } else {
            base
        }
    }

    /// Run `operation` until it succeeds or the retry budget is spent.
    ///
    /// Attempts `retries + 1` times, sleeping `backoff(attempt)` between
    /// attempts. On exhaustion the last error is wrapped as
    /// [`ClientError::RetriesExhausted`] with the total attempt count.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt > self.retries {
                        warn!(
                            attempts = attempt,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let delay = self.backoff(attempt);
                    debug!(
                        attempt,
                        retries = self.retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run `operation` with unbounded attempts until it succeeds or
    /// `is_closed` reports true at a retry boundary.
    ///
    /// Used by the pool's background reconnect loop: the `retries` ceiling is
    /// ignored, only the backoff schedule applies (capped at `max_timeout`),
    /// and an intentional pool shutdown is the single way to stop the loop.
    /// Returns `None` when abandoned because of the closed flag.
    pub async fn run_until_closed<F, Fut, T, C>(
        &self,
        mut operation: F,
        is_closed: C,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn() -> bool,
    {
        let mut attempt: u32 = 1;

        loop {
            if is_closed() {
                debug!(attempt, "pool closed, abandoning retry loop");
                return None;
            }

            match operation().await {
                Ok(value) => return Some(value),
                Err(err) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Per-call retry request: either the built-in defaults (the boolean `true`
/// shorthand of the original API) or an explicit policy.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrySpec {
    /// Retry with [`RetryPolicy::default()`].
    Defaults,
    /// Retry with the given policy.
    Policy(RetryPolicy),
}

impl RetrySpec {
    /// Resolve the concrete policy to run with.
    pub fn policy(&self) -> RetryPolicy {
        match self {
            RetrySpec::Defaults => RetryPolicy::default(),
            RetrySpec::Policy(policy) => policy.clone(),
        }
    }
}

impl From<RetryPolicy> for RetrySpec {
    fn from(policy: RetryPolicy) -> Self {
        RetrySpec::Policy(policy)
    }
}
