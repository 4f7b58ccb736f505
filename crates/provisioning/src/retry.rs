//! Bounded retry with exponential backoff for external calls.
//!
//! One policy is shared by every call site that talks to the processor or
//! the store. Only errors the predicate accepts are retried; everything else
//! returns on the first failure.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProvisioningError, Result};

/// Retry configuration: attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts in total, waiting 1s then 2s between them.
    ///
    /// The 4s step of the backoff curve only serves as `max_delay`; it is
    /// reached when a caller raises `max_attempts` above three.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: initial_delay.saturating_mul(4),
        }
    }

    /// Same attempt budget, no waiting. Used by tests.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-indexed): 1s, 2s, 4s, ...
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Runs `operation`, retrying transient [`ProvisioningError`]s.
    pub async fn run<T, F, Fut>(&self, operation_name: &'static str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with_predicate(operation_name, operation, ProvisioningError::is_transient)
            .await
    }

    /// Runs `operation`, retrying whenever `should_retry` accepts the error.
    pub async fn run_with_predicate<T, E, F, Fut, P>(
        &self,
        operation_name: &'static str,
        mut operation: F,
        should_retry: P,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !should_retry(&err) {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "giving up"
                        );
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    metrics::counter!("retries_total", "operation" => operation_name).increment(1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
