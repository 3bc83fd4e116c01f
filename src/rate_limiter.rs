//! Local admission control in front of backend calls.
//!
//! A [`RateLimiter`] enforces three limits together: requests per minute,
//! estimated tokens per minute and calls in flight. The per-minute limits
//! refill continuously. Both are checked under one lock, so a rejected
//! request consumes neither budget.
//!
//! ```text
//! acquire(estimate)
//!   ├─ semaphore slot (max_concurrent) ──── held by RateLimitGuard
//!   └─ Budgets { requests, tokens } ─── admit both or wait max(deficits)
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{HubError, Result};

const WINDOW: Duration = Duration::from_secs(60);

/// Limits applied by a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    /// Estimated prompt plus completion tokens.
    pub tokens_per_minute: u64,
    pub max_concurrent: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 90_000,
            max_concurrent: 10,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 || self.tokens_per_minute == 0 || self.max_concurrent == 0
        {
            return Err(HubError::Config(
                "rate limiter limits must all be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A continuously refilling allowance of `capacity` units per [`WINDOW`].
#[derive(Debug)]
struct Quota {
    capacity: f64,
    level: f64,
}

impl Quota {
    fn full(capacity: f64) -> Self {
        Self {
            capacity,
            level: capacity,
        }
    }

    fn per_sec(&self) -> f64 {
        self.capacity / WINDOW.as_secs_f64()
    }

    fn advance(&mut self, elapsed: Duration) {
        self.level = (self.level + elapsed.as_secs_f64() * self.per_sec()).min(self.capacity);
    }

    /// Time until `amount` is available; zero if it already is.
    fn deficit(&self, amount: f64) -> Duration {
        if self.level >= amount {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((amount - self.level) / self.per_sec())
        }
    }
}

#[derive(Debug)]
struct Budgets {
    requests: Quota,
    tokens: Quota,
    updated_at: Instant,
}

impl Budgets {
    fn sync(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated_at);
        self.requests.advance(elapsed);
        self.tokens.advance(elapsed);
        self.updated_at = now;
    }

    /// Take one request and `tokens` if both fit, else report which limit
    /// is short and how long until both would fit.
    fn admit(&mut self, tokens: f64) -> std::result::Result<(), (&'static str, Duration)> {
        self.sync();
        let wait_requests = self.requests.deficit(1.0);
        let wait_tokens = self.tokens.deficit(tokens);
        if wait_requests.is_zero() && wait_tokens.is_zero() {
            self.requests.level -= 1.0;
            self.tokens.level -= tokens;
            return Ok(());
        }
        let limit = if wait_requests >= wait_tokens {
            "requests per minute"
        } else {
            "tokens per minute"
        };
        Err((limit, wait_requests.max(wait_tokens)))
    }
}

/// Requests-, tokens- and concurrency-limiter shared by all calls through
/// one middleware instance.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    budgets: Mutex<Budgets>,
    in_flight: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            budgets: Mutex::new(Budgets {
                requests: Quota::full(config.requests_per_minute as f64),
                tokens: Quota::full(config.tokens_per_minute as f64),
                updated_at: Instant::now(),
            }),
            in_flight: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait until a call with `estimated_tokens` may proceed.
    ///
    /// The concurrency slot is taken first and held by the returned guard.
    pub async fn acquire(&self, estimated_tokens: usize) -> Result<RateLimitGuard> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HubError::RateLimited("rate limiter closed".to_string()))?;

        let tokens = self.bounded(estimated_tokens);
        loop {
            let verdict = self.budgets.lock().admit(tokens);
            match verdict {
                Ok(()) => return Ok(RateLimitGuard { _permit: permit }),
                Err((limit, wait)) => {
                    debug!(limit, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Admit a call now or fail.
    ///
    /// # Errors
    ///
    /// [`HubError::RateLimited`] naming the exhausted limit.
    pub fn try_acquire(&self, estimated_tokens: usize) -> Result<RateLimitGuard> {
        let permit = self.in_flight.clone().try_acquire_owned().map_err(|_| {
            HubError::RateLimited(format!(
                "{} concurrent requests in flight",
                self.config.max_concurrent
            ))
        })?;

        let tokens = self.bounded(estimated_tokens);
        self.budgets.lock().admit(tokens).map_err(|(limit, wait)| {
            HubError::RateLimited(format!("{} exhausted, retry in {:?}", limit, wait))
        })?;
        Ok(RateLimitGuard { _permit: permit })
    }

    /// An estimate above the whole per-minute budget is charged as the
    /// whole budget, otherwise it could never be admitted.
    fn bounded(&self, estimated: usize) -> f64 {
        (estimated as f64).min(self.config.tokens_per_minute as f64)
    }

    /// Charge tokens a call used beyond its estimate. The budget may go
    /// negative, delaying later calls until it recovers.
    pub fn record_usage(&self, actual_tokens: usize, estimated_tokens: usize) {
        let Some(overrun) = actual_tokens.checked_sub(estimated_tokens) else {
            return;
        };
        if overrun > 0 {
            let mut budgets = self.budgets.lock();
            budgets.sync();
            budgets.tokens.level -= overrun as f64;
        }
    }

    pub fn available_requests(&self) -> f64 {
        let mut budgets = self.budgets.lock();
        budgets.sync();
        budgets.requests.level
    }

    pub fn available_tokens(&self) -> f64 {
        let mut budgets = self.budgets.lock();
        budgets.sync();
        budgets.tokens.level
    }

    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }
}

/// Holds a concurrency slot until dropped.
#[derive(Debug)]
pub struct RateLimitGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_quota_refills_over_window() {
        let mut quota = Quota::full(60.0);
        quota.level = 0.0;
        assert_eq!(quota.deficit(5.0), Duration::from_secs(5));

        quota.advance(Duration::from_secs(2));
        assert_eq!(quota.level, 2.0);

        quota.advance(Duration::from_secs(600));
        assert_eq!(quota.level, 60.0);
    }

    #[tokio::test]
    async fn test_guard_holds_concurrency_slot() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(100, 10_000).with_max_concurrent(5));

        let guard = limiter.acquire(100).await.unwrap();
        assert_eq!(limiter.available_slots(), 4);
        drop(guard);
        assert_eq!(limiter.available_slots(), 5);
    }

    #[tokio::test]
    async fn test_try_acquire_reports_request_limit() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(2, 10_000));
        let _a = limiter.try_acquire(1).unwrap();
        let _b = limiter.try_acquire(1).unwrap();
        let err = limiter.try_acquire(1).unwrap_err();
        assert!(matches!(err, HubError::RateLimited(msg) if msg.contains("requests per minute")));
    }

    #[tokio::test]
    async fn test_try_acquire_reports_concurrency_limit() {
        let limiter = RateLimiter::new(RateLimiterConfig::default().with_max_concurrent(1));
        let _held = limiter.try_acquire(1).unwrap();
        let err = limiter.try_acquire(1).unwrap_err();
        assert!(matches!(err, HubError::RateLimited(msg) if msg.contains("concurrent")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_consumes_nothing() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(10, 1_000));
        limiter.try_acquire(900).unwrap();

        let err = limiter.try_acquire(500).unwrap_err();
        assert!(matches!(err, HubError::RateLimited(msg) if msg.contains("tokens per minute")));
        assert_eq!(limiter.available_requests(), 9.0);
        assert_eq!(limiter.available_tokens(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(60, 10_000));
        for _ in 0..60 {
            limiter.try_acquire(1).unwrap();
        }

        let start = Instant::now();
        let _guard = limiter.acquire(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_estimate_is_bounded() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(60, 1_000));
        assert!(limiter.try_acquire(50_000).is_ok());
        assert_eq!(limiter.available_tokens(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_usage_charges_overrun() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(60, 1_000));
        limiter.try_acquire(100).unwrap();
        limiter.record_usage(400, 100);
        assert_eq!(limiter.available_tokens(), 600.0);

        limiter.record_usage(50, 100);
        assert_eq!(limiter.available_tokens(), 600.0);
    }

    #[test]
    fn test_config_validate() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        assert!(RateLimiterConfig::new(0, 1).validate().is_err());
        assert!(RateLimiterConfig::default().with_max_concurrent(0).validate().is_err());
    }
}
