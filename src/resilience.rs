//! Retry policy for transient peer failures.
//!
//! Only errors the taxonomy marks retryable ([`ReplicationError::is_retryable`])
//! are retried; everything else surfaces immediately. Continuous
//! replications use the [`RetryConfig::daemon`] preset and effectively
//! never give up, one-shot replications use [`RetryConfig::default`].

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior against a peer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (the first try included).
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Infinite retry for continuous replications (never give up).
    ///
    /// Retries forever with exponential backoff capped at 5 minutes.
    /// A source that is down for hours resumes without operator action.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Bounded retry sized from a task's `retries_per_request` setting.
    pub fn per_request(retries: u32) -> Self {
        Self {
            max_attempts: retries as usize + 1,
            ..Self::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `operation`, retrying retryable failures per `config`.
///
/// `label` names the operation in retry logs. The last error is returned
/// once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1usize;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                crate::metrics::record_retry(label);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
