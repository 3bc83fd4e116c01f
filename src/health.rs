//! Backend health monitoring.
//!
//! The monitor polls every registered backend name on an interval. Each probe
//! runs concurrently under its own timeout; a slow or failing probe never
//! delays the others.
//!
//! # Classification
//!
//! | Probe outcome | Previous state | New state |
//! |---------------|----------------|-----------|
//! | success | UNHEALTHY, successes < `recovery_threshold` | UNHEALTHY |
//! | success | any other | HEALTHY (DEGRADED if slower than `degraded_latency`) |
//! | failure / timeout | failures < `failure_threshold` | DEGRADED |
//! | failure / timeout | failures >= `failure_threshold` | UNHEALTHY |
//!
//! With `auto_disable`, entering UNHEALTHY disables every replica of the
//! backend in the registry and leaving it re-enables them.

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{HubError, Result};
use crate::registry::ProviderRegistry;
use crate::traits::HealthProbe;

/// Health classification of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Selection band; lower is better.
    pub fn rank(&self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Polling period.
    pub interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Consecutive failures that make a backend UNHEALTHY.
    pub failure_threshold: u32,
    /// Consecutive successes that bring an UNHEALTHY backend back.
    pub recovery_threshold: u32,
    /// Successful probes slower than this classify as DEGRADED.
    pub degraded_latency: Option<Duration>,
    /// Toggle registry enablement on UNHEALTHY transitions.
    pub auto_disable: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_threshold: 2,
            degraded_latency: None,
            auto_disable: false,
        }
    }
}

impl HealthConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_threshold(mut self, threshold: u32) -> Self {
        self.recovery_threshold = threshold;
        self
    }

    pub fn with_degraded_latency(mut self, latency: Duration) -> Self {
        self.degraded_latency = Some(latency);
        self
    }

    pub fn with_auto_disable(mut self, enabled: bool) -> Self {
        self.auto_disable = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(HubError::Config("health interval must be positive".to_string()));
        }
        if self.probe_timeout.is_zero() {
            return Err(HubError::Config("health probe_timeout must be positive".to_string()));
        }
        if self.failure_threshold == 0 || self.recovery_threshold == 0 {
            return Err(HubError::Config(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Latest health information for one backend name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHealthResult {
    pub backend_name: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_checked_at: Instant,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

/// Callback receiving the full result set after every polling cycle.
pub type HealthListener = Arc<dyn Fn(&[ProviderHealthResult]) + Send + Sync>;

/// Polls backend health probes and tracks their classification.
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<ProviderRegistry>,
    results: DashMap<String, ProviderHealthResult>,
    listeners: RwLock<Vec<HealthListener>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            config,
            registry,
            results: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a listener for cycle results.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&[ProviderHealthResult]) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Latest result for `name`.
    pub fn get(&self, name: &str) -> Option<ProviderHealthResult> {
        self.results.get(name).map(|r| r.value().clone())
    }

    /// Latest state for `name`; `None` until the first probe.
    pub fn state(&self, name: &str) -> Option<HealthState> {
        self.results.get(name).map(|r| r.value().state)
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.state(name) == Some(HealthState::Healthy)
    }

    /// All results, sorted by backend name.
    pub fn results(&self) -> Vec<ProviderHealthResult> {
        let mut all: Vec<ProviderHealthResult> =
            self.results.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.backend_name.cmp(&b.backend_name));
        all
    }

    /// Forget a backend's history.
    pub fn forget(&self, name: &str) -> bool {
        self.results.remove(name).is_some()
    }

    /// Probe one backend name now.
    ///
    /// # Errors
    ///
    /// [`HubError::Selection`] if nothing is registered under `name`.
    pub async fn check_backend(&self, name: &str) -> Result<ProviderHealthResult> {
        let backend = self
            .registry
            .get(name, 0)
            .ok_or_else(|| HubError::Selection(format!("backend '{}' is not registered", name)))?;
        let (outcome, latency) = self.probe(backend.as_ref()).await;
        Ok(self.record(name, outcome, latency))
    }

    /// Probe every registered name concurrently, update state and notify
    /// listeners. Returns the full result set.
    pub async fn check_all(&self) -> Vec<ProviderHealthResult> {
        let names = self.registry.names();
        let probes = names.iter().filter_map(|name| {
            let backend = self.registry.get(name, 0)?;
            Some(async move {
                let (outcome, latency) = self.probe(backend.as_ref()).await;
                (name.as_str(), outcome, latency)
            })
        });

        for (name, outcome, latency) in join_all(probes).await {
            self.record(name, outcome, latency);
        }

        let results = self.results();
        let listeners: Vec<HealthListener> = self.listeners.read().clone();
        for listener in &listeners {
            listener(&results);
        }
        results
    }

    async fn probe(
        &self,
        backend: &dyn crate::traits::Backend,
    ) -> (std::result::Result<(), String>, Duration) {
        let start = Instant::now();
        // a panicking probe fails only its own backend's check
        let guarded = AssertUnwindSafe(backend.health_probe()).catch_unwind();
        let outcome = match tokio::time::timeout(self.config.probe_timeout, guarded).await {
            Ok(Ok(Ok(HealthProbe { healthy: true, .. }))) => Ok(()),
            Ok(Ok(Ok(HealthProbe { message, .. }))) => {
                Err(message.unwrap_or_else(|| "backend reported unhealthy".to_string()))
            }
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => {
                warn!(backend = backend.name(), "Health probe panicked");
                Err("health probe panicked".to_string())
            }
            Err(_) => Err(format!(
                "health probe timed out after {:?}",
                self.config.probe_timeout
            )),
        };
        (outcome, start.elapsed())
    }

    /// Fold one probe outcome into the stored state.
    pub fn record(
        &self,
        name: &str,
        outcome: std::result::Result<(), String>,
        latency: Duration,
    ) -> ProviderHealthResult {
        let now = Instant::now();
        let previous = self.results.get(name).map(|r| r.value().clone());
        let prev_state = previous.as_ref().map(|p| p.state);
        let (mut failures, mut successes) = previous
            .as_ref()
            .map(|p| (p.consecutive_failures, p.consecutive_successes))
            .unwrap_or((0, 0));

        let (state, last_error) = match outcome {
            Ok(()) => {
                failures = 0;
                successes += 1;
                let slow = self.config.degraded_latency.is_some_and(|limit| latency > limit);
                let state = if prev_state == Some(HealthState::Unhealthy)
                    && successes < self.config.recovery_threshold
                {
                    HealthState::Unhealthy
                } else if slow {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
                (state, None)
            }
            Err(message) => {
                successes = 0;
                failures += 1;
                let state = if failures >= self.config.failure_threshold {
                    HealthState::Unhealthy
                } else {
                    HealthState::Degraded
                };
                (state, Some(message))
            }
        };

        let result = ProviderHealthResult {
            backend_name: name.to_string(),
            state,
            consecutive_failures: failures,
            consecutive_successes: successes,
            last_checked_at: now,
            last_latency: Some(latency),
            last_error,
        };
        self.results.insert(name.to_string(), result.clone());

        if prev_state != Some(state) {
            self.on_transition(name, prev_state, state, result.last_error.as_deref());
        }
        result
    }

    fn on_transition(
        &self,
        name: &str,
        from: Option<HealthState>,
        to: HealthState,
        error: Option<&str>,
    ) {
        match to {
            HealthState::Unhealthy => {
                warn!(backend = %name, error = error.unwrap_or(""), "Backend became unhealthy")
            }
            _ => info!(backend = %name, from = ?from, to = %to, "Backend health changed"),
        }

        if !self.config.auto_disable {
            return;
        }
        if to == HealthState::Unhealthy {
            let disabled = self.registry.disable(name);
            debug!(backend = %name, disabled, "Auto-disabled unhealthy backend");
        } else if from == Some(HealthState::Unhealthy) {
            let enabled = self.registry.enable(name);
            debug!(backend = %name, enabled, "Re-enabled recovered backend");
        }
    }

    /// Start polling every `interval`. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                let results = monitor.check_all().await;
                debug!(backends = results.len(), "Health cycle complete");
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
    }

    /// Stop polling.
    pub fn stop(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;
    use crate::registry::RegisterOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(config: HealthConfig) -> (Arc<ProviderRegistry>, Arc<MockBackend>, Arc<HealthMonitor>) {
        let registry = Arc::new(ProviderRegistry::new());
        let backend = Arc::new(MockBackend::new("svc"));
        registry
            .register(backend.clone(), serde_json::Value::Null, RegisterOptions::default())
            .unwrap();
        let monitor = Arc::new(HealthMonitor::new(config, registry.clone()));
        (registry, backend, monitor)
    }

    #[test]
    fn test_config_validate() {
        assert!(HealthConfig::default().validate().is_ok());
        assert!(HealthConfig::default()
            .with_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(HealthConfig::default()
            .with_recovery_threshold(0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_before_first_probe() {
        let (_, _, monitor) = setup(HealthConfig::default());
        assert_eq!(monitor.state("svc"), None);
        assert!(!monitor.is_healthy("svc"));
    }

    #[tokio::test]
    async fn test_success_is_healthy() {
        let (_, _, monitor) = setup(HealthConfig::default());
        let result = monitor.check_backend("svc").await.unwrap();
        assert_eq!(result.state, HealthState::Healthy);
        assert_eq!(result.consecutive_successes, 1);
        assert!(monitor.is_healthy("svc"));
    }

    #[tokio::test]
    async fn test_failures_degrade_then_unhealthy() {
        let (_, backend, monitor) = setup(HealthConfig::default().with_failure_threshold(3));
        backend.set_healthy(false);

        let r1 = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r1.state, HealthState::Degraded);
        assert!(r1.last_error.is_some());

        monitor.check_backend("svc").await.unwrap();
        let r3 = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r3.state, HealthState::Unhealthy);
        assert_eq!(r3.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_recovery_needs_threshold_successes() {
        let (_, backend, monitor) = setup(
            HealthConfig::default()
                .with_failure_threshold(1)
                .with_recovery_threshold(2),
        );
        backend.set_healthy(false);
        monitor.check_backend("svc").await.unwrap();
        assert_eq!(monitor.state("svc"), Some(HealthState::Unhealthy));

        backend.set_healthy(true);
        let r = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r.state, HealthState::Unhealthy);
        assert_eq!(r.consecutive_failures, 0);

        let r = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r.state, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let (_, backend, monitor) = setup(
            HealthConfig::default()
                .with_probe_timeout(Duration::from_millis(100))
                .with_failure_threshold(1),
        );
        backend.set_probe_delay(Duration::from_secs(1));

        let r = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r.state, HealthState::Unhealthy);
        assert!(r.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_success_is_degraded() {
        let (_, backend, monitor) = setup(
            HealthConfig::default().with_degraded_latency(Duration::from_millis(200)),
        );
        backend.set_probe_delay(Duration::from_millis(500));
        let r = monitor.check_backend("svc").await.unwrap();
        assert_eq!(r.state, HealthState::Degraded);
        assert!(r.last_error.is_none());
    }

    #[tokio::test]
    async fn test_auto_disable_and_reenable() {
        let (registry, backend, monitor) = setup(
            HealthConfig::default()
                .with_failure_threshold(1)
                .with_recovery_threshold(1)
                .with_auto_disable(true),
        );

        backend.set_healthy(false);
        monitor.check_backend("svc").await.unwrap();
        assert!(!registry.get_entry("svc", 0).unwrap().enabled);

        backend.set_healthy(true);
        monitor.check_backend("svc").await.unwrap();
        assert!(registry.get_entry("svc", 0).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_without_auto_disable_registry_untouched() {
        let (registry, backend, monitor) = setup(HealthConfig::default().with_failure_threshold(1));
        backend.set_healthy(false);
        monitor.check_backend("svc").await.unwrap();
        assert!(registry.get_entry("svc", 0).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_check_all_notifies_listeners_with_full_set() {
        let (registry, _, monitor) = setup(HealthConfig::default());
        let other = Arc::new(MockBackend::new("other"));
        other.set_healthy(false);
        registry
            .register(other, serde_json::Value::Null, RegisterOptions::default())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.add_listener(move |results| {
            sink.lock()
                .push(results.iter().map(|r| (r.backend_name.clone(), r.state)).collect::<Vec<_>>());
        });

        let results = monitor.check_all().await;
        assert_eq!(results.len(), 2);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            vec![
                ("other".to_string(), HealthState::Degraded),
                ("svc".to_string(), HealthState::Healthy)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_run_independently() {
        let (registry, slow, monitor) = setup(
            HealthConfig::default().with_probe_timeout(Duration::from_secs(2)),
        );
        slow.set_probe_delay(Duration::from_secs(10));
        registry
            .register(
                Arc::new(MockBackend::new("fast")),
                serde_json::Value::Null,
                RegisterOptions::default(),
            )
            .unwrap();

        let start = Instant::now();
        monitor.check_all().await;
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(monitor.state("fast"), Some(HealthState::Healthy));
        assert_eq!(monitor.state("svc"), Some(HealthState::Degraded));
    }

    struct Crashing;

    #[async_trait::async_trait]
    impl crate::traits::Backend for Crashing {
        fn name(&self) -> &str {
            "crashing"
        }

        async fn call(
            &self,
            _request: &crate::traits::CompletionRequest,
        ) -> Result<crate::traits::LLMResponse> {
            Ok(crate::traits::LLMResponse::new("ok", "m"))
        }

        async fn health_probe(&self) -> Result<HealthProbe> {
            panic!("probe handler crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_probe_fails_only_its_backend() {
        let (registry, _, monitor) = setup(HealthConfig::default());
        registry
            .register(Arc::new(Crashing), serde_json::Value::Null, RegisterOptions::default())
            .unwrap();

        let results = monitor.check_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].backend_name, "crashing");
        assert_eq!(results[0].state, HealthState::Degraded);
        assert!(results[0].last_error.as_deref().unwrap().contains("panicked"));
        assert_eq!(results[1].state, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_runs_on_interval_and_stops() {
        let (_, _, monitor) = setup(HealthConfig::default().with_interval(Duration::from_secs(30)));
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = cycles.clone();
        monitor.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), 3);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_check_unknown_backend() {
        let (_, _, monitor) = setup(HealthConfig::default());
        assert!(matches!(
            monitor.check_backend("ghost").await,
            Err(HubError::Selection(_))
        ));
    }
}
