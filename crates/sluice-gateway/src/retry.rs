//! Backoff policy for provider hook registration.
//!
//! Registration calls a third-party API that may be rate limited or briefly
//! unavailable while the listener is already serving. Attempts are bounded;
//! after the last one the source is reported degraded instead of retried
//! forever.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Succeeded(T),
    /// Every attempt failed, or the error was not retryable.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        last_error: E,
    },
    /// Cancelled while waiting between attempts.
    Cancelled,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), with jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base_delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * attempt.max(1),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.base_delay * multiplier
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.max_delay);

        let jittered_delay = apply_jitter(capped_delay, self.jitter_factor);

        std::cmp::min(jittered_delay, self.max_delay)
    }

    /// Runs `operation` until it succeeds, returns a non-retryable error, or
    /// the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => return RetryOutcome::Succeeded(value),
                Err(error) => error,
            };

            if attempt >= max_attempts || !is_retryable(&error) {
                return RetryOutcome::Exhausted { attempts: attempt, last_error: error };
            }

            let delay = self.delay_after(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return RetryOutcome::Cancelled,
                () = tokio::time::sleep(delay) => {},
            }
            attempt += 1;
        }
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor percentage.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
