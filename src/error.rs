//! Hub error types with retry strategies.
//!
//! # Error Handling Philosophy
//!
//! Errors should be:
//! 1. **Actionable**: Tell the caller what to do, not just what went wrong
//! 2. **Specific**: Name the backend and the limit that was hit
//! 3. **Recoverable**: Distinguish transient errors (retry) from permanent ones
//!
//! # Taxonomy
//!
//! | Error | Raised when | Same-backend retry | Fallback |
//! |-------|-------------|--------------------|----------|
//! | `Selection` | No eligible backend | no | no |
//! | `CircuitOpen` | Breaker rejected the call | no | yes |
//! | `Backend` | Adapter reported a failure | per `retryable` | yes |
//! | `Timeout` | Per-call deadline expired | yes | yes |
//! | `Validation` | Malformed request | no | no |
//! | `AggregateFailure` | Every permitted attempt failed | no | no |
//!
//! # Retry Strategies
//!
//! Each error maps to a [`RetryStrategy`]:
//! - `ExponentialBackoff`: transient network/server errors
//! - `WaitAndRetry`: rate limiting
//! - `NoRetry`: permanent errors, open circuits, invalid requests

use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

// ============================================================================
// Retry Strategy
// ============================================================================

/// Strategy for retrying a failed call against the same backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff (for transient errors).
    ExponentialBackoff {
        /// Initial delay before first retry.
        base_delay: Duration,
        /// Maximum delay between retries.
        max_delay: Duration,
        /// Maximum number of attempts, including the first one.
        max_attempts: u32,
    },

    /// Wait for a specific duration then retry once (for rate limits).
    WaitAndRetry {
        /// Duration to wait before retrying.
        wait: Duration,
    },

    /// Do not retry at all (permanent error).
    NoRetry,
}

impl RetryStrategy {
    /// Standard exponential backoff for timeouts and network errors.
    pub fn network_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_millis(125),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    /// Standard exponential backoff for server-side backend errors.
    pub fn server_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    /// Check if this strategy allows retrying.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::NoRetry)
    }
}

// ============================================================================
// Hub Error Types
// ============================================================================

/// Errors that can occur while orchestrating a request.
#[derive(Debug, Error)]
pub enum HubError {
    /// No eligible backend could be selected.
    #[error("No available backend: {0}")]
    Selection(String),

    /// The backend's circuit breaker rejected the call.
    #[error("Circuit breaker open for backend '{backend}'")]
    CircuitOpen {
        /// Backend whose breaker is open.
        backend: String,
    },

    /// Failure reported by a backend adapter.
    #[error("Backend '{backend}' failed: {message}")]
    Backend {
        /// Backend that failed.
        backend: String,
        /// Adapter-supplied failure description.
        message: String,
        /// Whether the same backend may be retried.
        retryable: bool,
    },

    /// A backend call exceeded its deadline.
    #[error("Backend '{backend}' timed out after {timeout:?}")]
    Timeout {
        /// Backend that timed out.
        backend: String,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// Malformed request.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Every permitted attempt failed; errors are in attempt order.
    #[error("All {} attempts failed: {}", .errors.len(), summarize(.errors))]
    AggregateFailure {
        /// Per-attempt errors, oldest first.
        errors: Vec<HubError>,
    },

    /// Local rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Feature not supported by a backend.
    #[error("Not supported: {0}")]
    NotSupported(String),
}

fn summarize(errors: &[HubError]) -> String {
    let mut out = String::new();
    for (i, err) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "#{} {}", i + 1, err);
    }
    out
}

impl HubError {
    /// Retryable backend failure.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent backend failure (auth, bad model, ...).
    pub fn backend_fatal(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Get the retry strategy for calling the same backend again.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_hub::{HubError, RetryStrategy};
    ///
    /// let error = HubError::backend("openai", "502 bad gateway");
    /// assert!(error.retry_strategy().should_retry());
    ///
    /// let error = HubError::Validation("empty messages".to_string());
    /// assert_eq!(error.retry_strategy(), RetryStrategy::NoRetry);
    /// ```
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Timeout { .. } => RetryStrategy::network_backoff(),

            Self::Backend {
                retryable: true, ..
            } => RetryStrategy::server_backoff(),

            Self::RateLimited(_) => RetryStrategy::WaitAndRetry {
                wait: Duration::from_secs(1),
            },

            Self::Serialization(_) => RetryStrategy::ExponentialBackoff {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                max_attempts: 2,
            },

            // An open breaker never clears by retrying the same backend
            Self::CircuitOpen { .. }
            | Self::Backend {
                retryable: false, ..
            }
            | Self::Selection(_)
            | Self::Validation(_)
            | Self::AggregateFailure { .. }
            | Self::Config(_)
            | Self::NotSupported(_) => RetryStrategy::NoRetry,
        }
    }

    /// Check if the same backend may be retried.
    pub fn is_retryable(&self) -> bool {
        self.retry_strategy().should_retry()
    }

    /// Check if the orchestrator may fall back to another backend.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Name of the backend the error is attributed to, if any.
    pub fn backend_name(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { backend }
            | Self::Backend { backend, .. }
            | Self::Timeout { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Get a user-friendly description of the error with suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::Selection(_) => {
                "No backend is available for this request. Check that a backend supporting the model is registered and enabled.".to_string()
            }
            Self::CircuitOpen { backend } => {
                format!("Backend '{}' is failing and temporarily blocked. It will be retried after the reset timeout.", backend)
            }
            Self::Backend { backend, .. } => {
                format!("Backend '{}' returned an error. Retrying...", backend)
            }
            Self::Timeout { backend, .. } => {
                format!("Backend '{}' did not answer in time. The server may be overloaded.", backend)
            }
            Self::Validation(msg) => format!("Invalid request: {}. Check your parameters.", msg),
            Self::AggregateFailure { errors } => format!(
                "All {} attempts failed. Check backend health and credentials.",
                errors.len()
            ),
            Self::RateLimited(_) => "Rate limited locally. Waiting before retry...".to_string(),
            Self::Config(msg) => format!("Configuration error: {}.", msg),
            Self::Serialization(_) => {
                "Failed to serialize the request. This is likely a bug in the caller.".to_string()
            }
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this backend.", feature)
            }
        }
    }
}
