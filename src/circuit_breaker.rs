//! Per-backend circuit breakers.
//!
//! ```text
//!            failures >= threshold (within window)
//!   CLOSED ───────────────────────────────────────► OPEN
//!     ▲                                              │
//!     │ success_threshold                            │ reset_timeout elapsed
//!     │ trial successes                              ▼ (checked on permit)
//!     └──────────────────────────────────────── HALF_OPEN
//!                                                    │
//!                         any trial failure ─────────┘──► OPEN
//! ```
//!
//! State changes are read-modify-write under one mutex, so concurrent
//! callers never observe a half-applied transition.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{HubError, Result};

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls probe for recovery.
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "closed"),
            CircuitPhase::Open => write!(f, "open"),
            CircuitPhase::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive trial successes that close a half-open circuit.
    pub success_threshold: u32,
    /// Time an open circuit waits before allowing trials.
    pub reset_timeout: Duration,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(HubError::Config(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(HubError::Config(
                "circuit breaker success_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(HubError::Config(
                "circuit breaker half_open_max_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    pub backend_name: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
    /// Calls rejected since creation.
    pub rejected: u64,
    /// Times the circuit has opened since creation.
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    phase: CircuitPhase,
    failure_count: u32,
    success_count: u32,
    window_started: Option<Instant>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    rejected: u64,
    times_opened: u64,
    /// Bumped whenever the circuit opens or is reset; permits from an
    /// earlier cycle no longer affect the counters.
    cycle: u64,
}

/// Circuit breaker guarding one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                phase: CircuitPhase::Closed,
                failure_count: 0,
                success_count: 0,
                window_started: None,
                opened_at: None,
                trials_in_flight: 0,
                rejected: 0,
                times_opened: 0,
                cycle: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to make a call.
    ///
    /// Moves OPEN to HALF_OPEN once `reset_timeout` has elapsed. The
    /// returned [`BreakerPermit`] records the outcome through
    /// [`success`](BreakerPermit::success) or
    /// [`failure`](BreakerPermit::failure). Dropping it without either,
    /// for example when the caller abandons the request, frees its
    /// half-open trial slot.
    ///
    /// # Errors
    ///
    /// [`HubError::CircuitOpen`] when the call is rejected.
    pub fn permit(&self) -> Result<BreakerPermit<'_>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.phase == CircuitPhase::Open {
            let ready = inner
                .opened_at
                .is_some_and(|at| now.duration_since(at) >= self.config.reset_timeout);
            if ready {
                info!(backend = %self.name, "Circuit breaker transitioning to half-open");
                inner.phase = CircuitPhase::HalfOpen;
                inner.success_count = 0;
                inner.trials_in_flight = 0;
            }
        }

        let trial = match inner.phase {
            CircuitPhase::Closed => false,
            CircuitPhase::HalfOpen if inner.trials_in_flight < self.config.half_open_max_calls => {
                inner.trials_in_flight += 1;
                debug!(
                    backend = %self.name,
                    in_flight = inner.trials_in_flight,
                    "Circuit breaker admitted trial call"
                );
                true
            }
            CircuitPhase::HalfOpen | CircuitPhase::Open => {
                inner.rejected += 1;
                return Err(HubError::CircuitOpen {
                    backend: self.name.clone(),
                });
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            cycle: inner.cycle,
            trial,
            settled: false,
        })
    }

    fn record_success(&self, cycle: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if inner.cycle != cycle {
            return;
        }
        match inner.phase {
            CircuitPhase::Closed => {
                inner.failure_count = 0;
                inner.window_started = None;
            }
            CircuitPhase::HalfOpen => {
                if trial {
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(backend = %self.name, "Circuit breaker closed");
                    inner.phase = CircuitPhase::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.window_started = None;
                    inner.opened_at = None;
                }
            }
            // admitted while closed, finished after the circuit opened
            CircuitPhase::Open => {}
        }
    }

    fn record_failure(&self, cycle: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.cycle != cycle {
            return;
        }
        match inner.phase {
            CircuitPhase::Closed => {
                let window_expired = inner
                    .window_started
                    .is_some_and(|start| now.duration_since(start) > self.config.failure_window);
                if window_expired || inner.window_started.is_none() {
                    inner.window_started = Some(now);
                    inner.failure_count = 0;
                }
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        backend = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker opened"
                    );
                    Self::open(&mut inner, now);
                }
            }
            CircuitPhase::HalfOpen => {
                warn!(backend = %self.name, "Trial call failed, circuit breaker re-opened");
                Self::open(&mut inner, now);
            }
            CircuitPhase::Open => {
                inner.failure_count += 1;
            }
        }
    }

    fn record_release(&self, cycle: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if trial && inner.cycle == cycle && inner.phase == CircuitPhase::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            debug!(backend = %self.name, "Circuit breaker trial slot released");
        }
    }

    fn open(inner: &mut BreakerInner, now: Instant) {
        inner.phase = CircuitPhase::Open;
        inner.opened_at = Some(now);
        inner.success_count = 0;
        inner.trials_in_flight = 0;
        inner.times_opened += 1;
        inner.cycle += 1;
    }

    /// Run `f` under the breaker, counting a `timeout` expiry as a failure.
    pub async fn call<F, Fut, T>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.permit()?;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result,
                Err(_) => Err(HubError::Timeout {
                    backend: self.name.clone(),
                    timeout: limit,
                }),
            },
            None => f().await,
        };
        match &outcome {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        outcome
    }

    /// Current phase, without applying the lazy OPEN to HALF_OPEN move.
    pub fn phase(&self) -> CircuitPhase {
        self.inner.lock().phase
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            backend_name: self.name.clone(),
            phase: inner.phase,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at,
            rejected: inner.rejected,
            times_opened: inner.times_opened,
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.phase = CircuitPhase::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.window_started = None;
        inner.opened_at = None;
        inner.trials_in_flight = 0;
        inner.cycle += 1;
        info!(backend = %self.name, "Circuit breaker reset");
    }
}

/// Admission granted by [`CircuitBreaker::permit`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// A permit dropped unsettled counts as neither and frees its trial slot.
#[derive(Debug)]
#[must_use = "an unsettled permit records no outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    cycle: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is one of the half-open trial calls.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.cycle, self.trial);
    }

    /// Timeouts count as failures too.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.cycle);
    }

    /// Give the permit back without recording an outcome.
    pub fn release(self) {}
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_release(self.cycle, self.trial);
        }
    }
}

/// One breaker per backend name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
                .value(),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn state(&self, name: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(name).map(|b| b.state())
    }

    /// Snapshots of every breaker, sorted by backend name.
    pub fn states(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> =
            self.breakers.iter().map(|b| b.value().state()).collect();
        states.sort_by(|a, b| a.backend_name.cmp(&b.backend_name));
        states
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_secs(10)),
        )
    }

    #[test]
    fn test_config_validate() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::default()
            .with_failure_threshold(0)
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::default()
            .with_half_open_max_calls(0)
            .validate()
            .is_err());
    }

    fn fail(cb: &CircuitBreaker) {
        cb.permit().unwrap().failure();
    }

    fn succeed(cb: &CircuitBreaker) {
        cb.permit().unwrap().success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_on_third_failure() {
        let cb = breaker(3);

        for expected in 1..=2 {
            fail(&cb);
            assert_eq!(cb.phase(), CircuitPhase::Closed);
            assert_eq!(cb.state().failure_count, expected);
        }

        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Open);
        assert!(cb.state().opened_at.is_some());

        let err = cb.permit().unwrap_err();
        assert!(matches!(err, HubError::CircuitOpen { ref backend } if backend == "svc"));
        assert_eq!(cb.state().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3);
        fail(&cb);
        fail(&cb);
        succeed(&cb);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_failure_window(Duration::from_secs(5)),
        );
        fail(&cb);
        tokio::time::advance(Duration::from_secs(6)).await;
        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
        assert_eq!(cb.state().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_reset_timeout() {
        let cb = breaker(1);
        fail(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Open);

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(cb.permit().is_err());
        assert_eq!(cb.phase(), CircuitPhase::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        let trial = cb.permit().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&cb);
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);

        succeed(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
        assert_eq!(cb.state().opened_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let cb = breaker(1);
        fail(&cb);
        let first_open = cb.state().opened_at.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        fail(&cb);

        let state = cb.state();
        assert_eq!(state.phase, CircuitPhase::Open);
        assert!(state.opened_at.unwrap() > first_open);
        assert_eq!(state.times_opened, 2);
        assert!(cb.permit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_cap() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = cb.permit().unwrap();
        assert!(matches!(cb.permit(), Err(HubError::CircuitOpen { .. })));

        trial.release();
        assert!(cb.permit().is_ok());
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_its_slot() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        {
            let _abandoned = cb.permit().unwrap();
        }
        tokio::time::advance(Duration::from_secs(3600)).await;

        succeed(&cb);
        succeed(&cb);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_from_earlier_cycle_is_ignored() {
        let cb = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_success_threshold(1)
                .with_half_open_max_calls(2)
                .with_reset_timeout(Duration::from_secs(10)),
        );
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        let first = cb.permit().unwrap();
        let late = cb.permit().unwrap();
        first.failure();
        assert_eq!(cb.phase(), CircuitPhase::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let current = cb.permit().unwrap();

        // neither settling nor dropping the stale permit touches this cycle
        late.success();
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
        assert_eq!(cb.state().success_count, 0);
        let second = cb.permit().unwrap();
        assert!(cb.permit().is_err());

        current.success();
        second.release();
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_counts_timeout_as_failure() {
        let cb = breaker(1);
        let result: Result<()> = cb
            .call(Some(Duration::from_millis(50)), || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(HubError::Timeout { .. })));
        assert_eq!(cb.phase(), CircuitPhase::Open);
    }

    #[tokio::test]
    async fn test_call_passes_through_success() {
        let cb = breaker(1);
        let value = cb.call(None, || async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1);
        fail(&cb);
        cb.reset();
        assert_eq!(cb.phase(), CircuitPhase::Closed);
        assert!(cb.permit().is_ok());
    }

    #[test]
    fn test_registry_one_breaker_per_name() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        let a1 = registry.get_or_create("a");
        let a2 = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a1, &a2));

        a1.permit().unwrap().failure();
        registry.get_or_create("b");

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].backend_name, "a");
        assert_eq!(states[0].phase, CircuitPhase::Open);
        assert_eq!(states[1].phase, CircuitPhase::Closed);

        registry.reset_all();
        assert_eq!(registry.state("a").unwrap().phase, CircuitPhase::Closed);
        assert!(registry.remove("a"));
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CircuitPhase::HalfOpen.to_string(), "half-open");
        assert_eq!(CircuitPhase::Open.to_string(), "open");
    }
}
