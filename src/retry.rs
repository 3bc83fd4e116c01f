//! Retry executor with exponential backoff.
//!
//! Each [`HubError`] carries its own [`RetryStrategy`]. The executor follows
//! it, bounded by a [`RetryPolicy`] so a caller can cap attempts and delays
//! below what the error would allow on its own.
//!
//! # Usage
//!
//! ```
//! use edgequake_hub::retry::{RetryExecutor, RetryPolicy};
//! use edgequake_hub::HubError;
//!
//! # async fn demo() -> Result<(), HubError> {
//! let executor = RetryExecutor::new().with_policy(RetryPolicy::default().with_max_attempts(2));
//! let value = executor
//!     .execute_auto(|_attempt| async { Ok::<_, HubError>(7) })
//!     .await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

use crate::error::{HubError, RetryStrategy};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Upper bounds applied on top of each error's own strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    /// Longest single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Executor for retry logic with configurable backoff strategies.
#[derive(Debug)]
pub struct RetryExecutor {
    log_retries: bool,
    policy: RetryPolicy,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new() -> Self {
        Self {
            log_retries: true,
            policy: RetryPolicy::default(),
        }
    }

    /// Create a retry executor without logging.
    pub fn silent() -> Self {
        Self {
            log_retries: false,
            ..Self::new()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` under an explicit strategy.
    ///
    /// Stops early when an error's own strategy is `NoRetry`.
    pub async fn execute<F, Fut, T>(
        &self,
        strategy: &RetryStrategy,
        mut operation: F,
    ) -> Result<T, HubError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HubError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(v) => {
                    if attempt > 1 && self.log_retries {
                        info!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => e,
            };

            let Some(delay) = self.next_delay(strategy, attempt) else {
                if self.log_retries && strategy.should_retry() {
                    warn!(attempts = attempt, error = %err, "Operation failed, giving up");
                }
                return Err(err);
            };

            if !err.is_retryable() {
                if self.log_retries {
                    debug!(error = %err, "Error is non-retryable, stopping");
                }
                return Err(err);
            }

            if self.log_retries {
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Attempt failed, retrying");
            }
            sleep(delay).await;
        }
    }

    /// Execute `operation`, deriving the strategy from each error.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute_auto<F, Fut, T>(&self, mut operation: F) -> Result<T, HubError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HubError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match operation(attempt).await {
                Ok(v) => {
                    if attempt > 1 && self.log_retries {
                        info!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => e,
            };

            let strategy = err.retry_strategy();
            let Some(delay) = self.next_delay(&strategy, attempt) else {
                if self.log_retries && strategy.should_retry() {
                    warn!(attempts = attempt, error = %err, "Retries exhausted");
                }
                return Err(err);
            };

            if self.log_retries {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
            }
            sleep(delay).await;
        }
    }

    /// Delay before attempt `attempt + 1`, or `None` to stop.
    fn next_delay(&self, strategy: &RetryStrategy, attempt: u32) -> Option<Duration> {
        match strategy {
            RetryStrategy::NoRetry => None,
            RetryStrategy::WaitAndRetry { wait } => {
                // one retry only
                (attempt < 2 && attempt < self.policy.max_attempts)
                    .then(|| (*wait).min(self.policy.max_delay))
            }
            RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
                max_attempts,
            } => {
                if attempt >= (*max_attempts).min(self.policy.max_attempts) {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt - 1);
                let delay = base_delay.saturating_mul(factor);
                Some(delay.min(*max_delay).min(self.policy.max_delay))
            }
        }
    }
}
