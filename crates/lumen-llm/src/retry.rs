use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

/// Exponential backoff for single-shot generation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn should_retry(&self, attempt: u32, error: &ProviderError) -> bool {
        error.retryable && attempt < self.max_attempts
    }

    /// Delay after the given 1-based failed attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let unbounded = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(unbounded.min(self.max_backoff.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts.
pub async fn execute_with_retry<T, Op, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: Op,
) -> Result<T, ProviderError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt, &err) => {
                let delay = policy.backoff_for_attempt(attempt);
                tracing::warn!(
                    provider = %err.provider,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
