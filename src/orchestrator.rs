//! The hub: selection, circuit breaking, middleware, caching and fallback
//! for one logical request.
//!
//! # Request flow
//!
//! ```text
//! complete(request)
//!   │ validate
//!   ▼
//! cache.get(key) ── hit ──────────────────────────────────────► response
//!   │ miss
//!   ▼
//! ┌─► registry.find(model, enabled, not excluded)
//! │     │
//! │   strategy.select ── none ──► Selection / AggregateFailure
//! │     │
//! │   breaker.permit ── rejected ──┐
//! │     │                          │
//! │   pipeline.execute(backend)    │
//! │     │ ok          │ err        │
//! │     ▼             ▼            ▼
//! │   cache.set    permit.failure, exclude backend
//! │   mark_used       │
//! │   metrics         │ attempts left?
//! │     │             │
//! └─────┼─────────────┘
//!       ▼
//!    response
//! ```
//!
//! # Example
//!
//! ```
//! use edgequake_hub::{CompletionRequest, Orchestrator, RegisterOptions, SelectionStrategy};
//! use edgequake_hub::providers::MockBackend;
//! use std::sync::Arc;
//!
//! # async fn demo() -> edgequake_hub::Result<()> {
//! let hub = Orchestrator::builder()
//!     .selection_strategy(SelectionStrategy::Priority)
//!     .add_backend(Arc::new(MockBackend::new("primary")), RegisterOptions::with_priority(1))
//!     .add_backend(Arc::new(MockBackend::new("backup")), RegisterOptions::with_priority(2))
//!     .build()
//!     .await?;
//!
//! let response = hub.complete(CompletionRequest::from_prompt("Hello")).await?;
//! assert_eq!(response.content, "response from primary");
//! # Ok(())
//! # }
//! ```

use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheConfig, CacheStats, LruCache};
use crate::cache_key::{CacheKeyConfig, CacheKeyGenerator};
use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::health::{HealthConfig, HealthMonitor};
use crate::metrics::MetricsRegistry;
use crate::middleware::{Middleware, MiddlewareContext, MiddlewarePipeline};
use crate::registry::{BackendFilter, ProviderRegistry, RegisterOptions, RegisteredBackend};
use crate::selection::{RoundRobinState, SelectionContext, SelectionStrategy};
use crate::traits::{Backend, CompletionRequest, LLMResponse, StreamChunk};

/// Request-flow settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub strategy: SelectionStrategy,
    /// Try other backends after a failure.
    pub enable_fallback: bool,
    /// Selection→call cycles per logical request, the first included.
    pub max_fallback_attempts: u32,
    /// Deadline for each backend call. A timeout counts as a failure.
    pub call_timeout: Option<Duration>,
    /// Whether [`Orchestrator::start`] launches the health poller.
    pub health_checks: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Priority,
            enable_fallback: true,
            max_fallback_attempts: 3,
            call_timeout: Some(Duration::from_secs(30)),
            health_checks: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.enable_fallback = enabled;
        self
    }

    pub fn with_max_fallback_attempts(mut self, attempts: u32) -> Self {
        self.max_fallback_attempts = attempts;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.health_checks = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_fallback_attempts == 0 {
            return Err(HubError::Config(
                "max_fallback_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(HubError::Config("call_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Attempts one logical request may make.
    fn attempt_budget(&self) -> u32 {
        if self.enable_fallback {
            self.max_fallback_attempts.max(1)
        } else {
            1
        }
    }
}

/// Errors that say nothing about the backend's own health.
fn counts_against_breaker(error: &HubError) -> bool {
    !matches!(
        error,
        HubError::Validation(_)
            | HubError::RateLimited(_)
            | HubError::CircuitOpen { .. }
            | HubError::NotSupported(_)
    )
}

/// Multi-backend request orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<dyn Cache<LLMResponse>>>,
    lru: Option<Arc<LruCache<LLMResponse>>>,
    sweep_interval: Option<Duration>,
    keys: CacheKeyGenerator,
    breakers: CircuitBreakerRegistry,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsRegistry>,
    pipeline: MiddlewarePipeline,
    round_robin: RoundRobinState,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.config.strategy
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a backend at runtime.
    pub fn register_backend(
        &self,
        backend: Arc<dyn Backend>,
        config: serde_json::Value,
        options: RegisterOptions,
    ) -> Result<RegisteredBackend> {
        self.registry.register(backend, config, options)
    }

    /// Remove every replica of `name` along with its breaker and health
    /// history. Returns the number of replicas removed.
    pub fn unregister_backend(&self, name: &str) -> usize {
        let removed = self.registry.remove(name);
        self.breakers.remove(name);
        self.health.forget(name);
        removed
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Complete `request` on whichever backend the strategy picks.
    pub async fn complete(&self, request: CompletionRequest) -> Result<LLMResponse> {
        self.execute(request, None).await
    }

    /// Complete `request` on the replicas registered as `backend`.
    pub async fn complete_with_backend(
        &self,
        request: CompletionRequest,
        backend: &str,
    ) -> Result<LLMResponse> {
        self.execute(request, Some(backend)).await
    }

    async fn execute(
        &self,
        request: CompletionRequest,
        explicit: Option<&str>,
    ) -> Result<LLMResponse> {
        request.validate()?;

        let cache_key = match &self.cache {
            Some(cache) => {
                let key = self.keys.generate(&request, explicit)?;
                match cache.get(&key).await {
                    Ok(Some(hit)) => {
                        self.metrics.record_cache_hit();
                        debug!(key = %key, "Cache hit");
                        return Ok(hit);
                    }
                    Ok(None) => self.metrics.record_cache_miss(),
                    Err(e) => warn!(error = %e, "Cache lookup failed, continuing"),
                }
                Some((cache, key))
            }
            None => None,
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let budget = self.config.attempt_budget();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut errors: Vec<HubError> = Vec::new();

        while (errors.len() as u32) < budget {
            let attempt = errors.len() as u32 + 1;
            let Some(chosen) = self.pick(&request, explicit, &excluded, false) else {
                break;
            };
            let name = chosen.name().to_string();
            if attempt > 1 {
                self.metrics.record_fallback();
                warn!(
                    request_id = %request_id,
                    backend = %name,
                    attempt,
                    "Falling back to next backend"
                );
            }

            match self.attempt(&chosen, &request, &request_id, attempt).await {
                Ok(response) => {
                    if let Some((cache, key)) = &cache_key {
                        if let Err(e) = cache.set(key, response.clone(), None).await {
                            warn!(error = %e, "Cache store failed");
                        }
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if !error.allows_fallback() {
                        return Err(error);
                    }
                    warn!(
                        request_id = %request_id,
                        backend = %name,
                        attempt,
                        error = %error,
                        "Backend attempt failed"
                    );
                    excluded.insert(name);
                    errors.push(error);
                }
            }
        }

        Err(Self::exhausted(errors, request.model.as_deref()))
    }

    /// One selection→call cycle against `chosen`.
    async fn attempt(
        &self,
        chosen: &RegisteredBackend,
        request: &CompletionRequest,
        request_id: &str,
        attempt: u32,
    ) -> Result<LLMResponse> {
        let name = chosen.name();
        let breaker = self.breakers.get_or_create(name);
        // dropped unsettled if the caller abandons this future mid-call
        let permit = breaker.permit()?;

        let mut ctx = MiddlewareContext::new(request.clone(), name, attempt)
            .with_request_id(request_id);
        let start = Instant::now();
        let result = self
            .pipeline
            .execute(&mut ctx, chosen.handle.as_ref(), self.config.call_timeout)
            .await;
        let latency = start.elapsed();

        match &result {
            Ok(response) => {
                permit.success();
                self.registry.mark_used_seq(name, chosen.seq);
                self.metrics.record_success(
                    name,
                    latency,
                    response.prompt_tokens,
                    response.completion_tokens,
                );
            }
            Err(error) => {
                if counts_against_breaker(error) {
                    permit.failure();
                } else {
                    permit.release();
                }
                self.metrics.record_failure(name, latency);
            }
        }
        result
    }

    /// Open a stream on the selected backend.
    ///
    /// Selection, breaker and fallback apply while the stream is being
    /// established. Streams bypass the cache and the middleware pipeline.
    pub async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        self.establish_stream(request, None).await
    }

    /// Open a stream on the replicas registered as `backend` only.
    pub async fn stream_with_backend(
        &self,
        request: CompletionRequest,
        backend: &str,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        self.establish_stream(request, Some(backend)).await
    }

    async fn establish_stream(
        &self,
        request: CompletionRequest,
        explicit: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        request.validate()?;

        let budget = self.config.attempt_budget();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut errors: Vec<HubError> = Vec::new();

        while (errors.len() as u32) < budget {
            let Some(chosen) = self.pick(&request, explicit, &excluded, true) else {
                break;
            };
            let name = chosen.name().to_string();
            if !errors.is_empty() {
                self.metrics.record_fallback();
            }

            match self.open_stream(&chosen, &request).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    if !error.allows_fallback() {
                        return Err(error);
                    }
                    warn!(backend = %name, error = %error, "Stream establishment failed");
                    excluded.insert(name);
                    errors.push(error);
                }
            }
        }

        Err(Self::exhausted(errors, request.model.as_deref()))
    }

    async fn open_stream(
        &self,
        chosen: &RegisteredBackend,
        request: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let name = chosen.name();
        let breaker = self.breakers.get_or_create(name);
        let permit = breaker.permit()?;

        let start = Instant::now();
        let call = chosen.handle.call_streaming(request);
        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(HubError::Timeout {
                    backend: name.to_string(),
                    timeout: limit,
                }),
            },
            None => call.await,
        };

        match &result {
            Ok(_) => {
                permit.success();
                self.registry.mark_used_seq(name, chosen.seq);
            }
            Err(error) => {
                if counts_against_breaker(error) {
                    permit.failure();
                } else {
                    permit.release();
                }
                self.metrics.record_failure(name, start.elapsed());
            }
        }
        result
    }

    fn exhausted(errors: Vec<HubError>, model: Option<&str>) -> HubError {
        if errors.is_empty() {
            HubError::Selection(match model {
                Some(m) => format!("no enabled backend supports model '{}'", m),
                None => "no enabled backend registered".to_string(),
            })
        } else {
            HubError::AggregateFailure { errors }
        }
    }

    /// Run the configured strategy over the current candidates.
    fn pick(
        &self,
        request: &CompletionRequest,
        explicit: Option<&str>,
        excluded: &HashSet<String>,
        streaming: bool,
    ) -> Option<RegisteredBackend> {
        let mut filter = BackendFilter::new()
            .enabled_only()
            .excluding(excluded.iter().cloned());
        if let Some(name) = explicit {
            filter = filter.name(name);
        }
        if let Some(model) = &request.model {
            filter = filter.model(model.clone());
        }

        let mut candidates = self.registry.find(&filter);
        if streaming {
            candidates.retain(|c| c.handle.capabilities().streaming);
        }

        let ctx = SelectionContext::new(excluded, &self.round_robin)
            .with_model(request.model.as_deref())
            .with_health(&self.health)
            .with_metrics(&self.metrics);
        self.config.strategy.select(&candidates, &ctx).cloned()
    }

    /// The backend the strategy would choose now for `request`.
    ///
    /// Round-robin selection advances its cursor.
    pub fn select_backend(&self, request: &CompletionRequest) -> Result<RegisteredBackend> {
        self.pick(request, None, &HashSet::new(), false)
            .ok_or_else(|| Self::exhausted(Vec::new(), request.model.as_deref()))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    pub fn breaker_state(&self, name: &str) -> Option<CircuitBreakerState> {
        self.breakers.state(name)
    }

    pub fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.breakers.states()
    }

    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }

    /// Cache statistics, or `None` when caching is off.
    pub async fn cache_stats(&self) -> Result<Option<CacheStats>> {
        match &self.cache {
            Some(cache) => Ok(Some(cache.stats().await?)),
            None => Ok(None),
        }
    }

    pub async fn clear_cache(&self) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch background tasks: the health poller and the cache sweeper.
    pub fn start(&self) {
        if self.config.health_checks {
            self.health.start();
        }

        if let (Some(lru), Some(interval)) = (&self.lru, self.sweep_interval) {
            let mut sweeper = self.sweeper.lock();
            if sweeper.as_ref().map_or(true, |h| h.is_finished()) {
                *sweeper = Some(lru.spawn_sweeper(interval));
            }
        }
        info!(
            backends = self.registry.count(),
            strategy = %self.config.strategy,
            "Orchestrator started"
        );
    }

    /// Stop background tasks and run middleware cleanup.
    pub async fn shutdown(&self) {
        self.health.stop();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.pipeline.cleanup_all().await;
        info!("Orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
        self.health.stop();
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("backends", &self.registry.names())
            .field("cache", &self.cache.is_some())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent construction of an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    cache: Option<CacheConfig>,
    cache_backend: Option<Arc<dyn Cache<LLMResponse>>>,
    cache_keys: CacheKeyConfig,
    breaker: CircuitBreakerConfig,
    health: HealthConfig,
    backends: Vec<(Arc<dyn Backend>, serde_json::Value, RegisterOptions)>,
    middlewares: Vec<(Arc<dyn Middleware>, i32)>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Defaults: priority selection, fallback on, no cache.
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            cache: None,
            cache_backend: None,
            cache_keys: CacheKeyConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            backends: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    /// Start from a loaded configuration file.
    pub fn from_config(config: &HubConfig) -> Self {
        let cache = config.cache_config();
        Self {
            config: config.orchestrator_config(),
            cache: cache.enabled.then_some(cache),
            cache_keys: config.cache_key.clone(),
            breaker: config.circuit_breaker_config(),
            health: config.health_config(),
            ..Self::new()
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn selection_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Use the in-process LRU cache.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Use a custom cache implementation.
    pub fn cache_backend(mut self, cache: Arc<dyn Cache<LLMResponse>>) -> Self {
        self.cache_backend = Some(cache);
        self
    }

    pub fn cache_keys(mut self, config: CacheKeyConfig) -> Self {
        self.cache_keys = config;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.config.enable_fallback = enabled;
        self
    }

    pub fn max_fallback_attempts(mut self, attempts: u32) -> Self {
        self.config.max_fallback_attempts = attempts;
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn add_backend(self, backend: Arc<dyn Backend>, options: RegisterOptions) -> Self {
        self.add_backend_with_config(backend, serde_json::Value::Null, options)
    }

    pub fn add_backend_with_config(
        mut self,
        backend: Arc<dyn Backend>,
        config: serde_json::Value,
        options: RegisterOptions,
    ) -> Self {
        self.backends.push((backend, config, options));
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>, priority: i32) -> Self {
        self.middlewares.push((middleware, priority));
        self
    }

    /// Validate settings, register backends and initialize middleware.
    pub async fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        self.breaker.validate()?;
        self.health.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        for (backend, config, options) in self.backends {
            registry.register(backend, config, options)?;
        }

        let (cache, lru, sweep_interval): (Option<Arc<dyn Cache<LLMResponse>>>, _, _) =
            match (self.cache_backend, self.cache) {
                (Some(custom), _) => (Some(custom), None, None),
                (None, Some(config)) if config.enabled => {
                    config.validate()?;
                    let lru = Arc::new(LruCache::new(&config));
                    (
                        Some(lru.clone() as Arc<dyn Cache<LLMResponse>>),
                        Some(lru),
                        config.sweep_interval,
                    )
                }
                _ => (None, None, None),
            };

        let pipeline = MiddlewarePipeline::new();
        for (middleware, priority) in self.middlewares {
            pipeline.add(middleware, priority).await?;
        }

        let health = Arc::new(HealthMonitor::new(self.health, registry.clone()));

        debug!(
            backends = registry.count(),
            middlewares = pipeline.len(),
            cache = cache.is_some(),
            "Orchestrator built"
        );

        Ok(Orchestrator {
            config: self.config,
            registry,
            cache,
            lru,
            sweep_interval,
            keys: CacheKeyGenerator::new(self.cache_keys),
            breakers: CircuitBreakerRegistry::new(self.breaker),
            health,
            metrics: Arc::new(MetricsRegistry::new()),
            pipeline,
            round_robin: RoundRobinState::new(),
            sweeper: Mutex::new(None),
        })
    }
}
