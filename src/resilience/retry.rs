//! Retry policy with exponential backoff.
//!
//! An explicit policy object the caller composes around a single operation,
//! outside the circuit breaker. Pair [`RetryPolicy::retry_if`] with
//! [`crate::GovernorError::is_counted`] and a circuit-open rejection stops
//! the retry loop immediately — no retry is ever attempted while the
//! breaker is open.

use std::time::Duration;
use tracing::{debug, warn};

/// Backoff strategy between attempts.
#[derive(Clone, Debug)]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: delay multiplies each attempt, capped.
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound on any single delay.
        max_delay: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

/// Retry policy: maximum attempts plus a backoff schedule.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first (never zero).
    pub max_attempts: usize,
    /// Backoff schedule between attempts.
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// Policy with exponential backoff (doubling, capped at `max_delay`).
    pub fn exponential(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier: 2.0,
            },
        }
    }

    /// Execute `f`, retrying on any error up to the attempt budget.
    ///
    /// # Errors
    ///
    /// The last error once all attempts are exhausted.
    pub async fn retry<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(&mut f, |_| true).await
    }

    /// Execute `f`, retrying only while `should_retry` approves the error.
    ///
    /// Non-retryable errors are returned immediately without sleeping.
    ///
    /// # Errors
    ///
    /// The first non-retryable error, or the last error once all attempts
    /// are exhausted.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut f: F, mut should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "retry: operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "retry: error is not retryable");
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                        return Err(e);
                    }

                    let delay = self.calculate_delay(attempt);
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry: operation failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before the retry following `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let millis =
                    initial_delay.as_millis() as f64 * multiplier.powi((attempt - 1) as i32);
                Duration::from_millis(millis as u64).min(*max_delay)
            }
        }
    }
}

/// Add up to 25% random jitter to a delay, spreading concurrent retries.
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter as u64)
}
