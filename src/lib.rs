//! EdgeQuake Hub - Request Orchestration for Interchangeable LLM Backends
//!
//! This crate sits in front of any number of completion backends and
//! decides, per request, which one answers:
//! - Provider registry with replica pools, priorities and tags
//! - Deterministic cache keys and an LRU + TTL response cache
//! - Six selection strategies (priority, round-robin, latency, cost,
//!   health, failover)
//! - Per-backend circuit breakers and background health monitoring
//! - A priority-ordered middleware pipeline around every backend call
//! - Fallback across backends with aggregated per-attempt errors
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────── Orchestrator ──────────────────────────────┐
//! │                                                                          │
//! │  Cache ◄── CacheKeyGenerator        SelectionStrategy ◄── HealthMonitor  │
//! │    │                                      │           ◄── MetricsRegistry│
//! │    ▼                                      ▼                              │
//! │  hit? ──no──► ProviderRegistry.find ──► select ──► CircuitBreaker.permit │
//! │                                                         │                │
//! │                     MiddlewarePipeline ◄────────────────┘                │
//! │                            │                                             │
//! │                            ▼                                             │
//! │                     Backend.call  ── failure ──► exclude, next attempt   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use edgequake_hub::providers::MockBackend;
//! use edgequake_hub::{CacheConfig, CompletionRequest, Orchestrator, RegisterOptions};
//! use std::sync::Arc;
//!
//! # async fn demo() -> edgequake_hub::Result<()> {
//! let hub = Orchestrator::builder()
//!     .cache(CacheConfig::new(1000))
//!     .add_backend(Arc::new(MockBackend::new("local")), RegisterOptions::default())
//!     .build()
//!     .await?;
//! hub.start();
//!
//! let response = hub.complete(CompletionRequest::from_prompt("Hello")).await?;
//! println!("{}", response.content);
//!
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the backend trait
//! - [`crate::middleware`] for writing middleware
//! - [`crate::config`] for the `hub.toml` format

pub mod cache;
pub mod cache_key;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod selection;
pub mod traits;

pub use cache::{Cache, CacheConfig, CacheEntry, CacheStats, LruCache};
pub use cache_key::{CacheKeyConfig, CacheKeyGenerator, KeyDigest};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitPhase,
};
pub use config::HubConfig;
pub use error::{HubError, Result, RetryStrategy};
pub use health::{HealthConfig, HealthMonitor, HealthState, ProviderHealthResult};
pub use metrics::{BackendCallStats, MetricsRegistry};
pub use middleware::{
    LogLevel, LoggingMiddleware, MetricsMiddleware, MetricsSummary, Middleware,
    MiddlewareContext, MiddlewarePipeline, Next, RateLimitMiddleware, RateLimitMode,
    RetryMiddleware, TimeoutMiddleware,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use registry::{BackendFilter, ProviderRegistry, RegisterOptions, RegisteredBackend};
pub use retry::{RetryExecutor, RetryPolicy};
pub use selection::{RoundRobinState, SelectionContext, SelectionStrategy};
pub use traits::{
    Backend, BackendCapabilities, BackendMetrics, ChatMessage, ChatRole, CompletionOptions,
    CompletionRequest, HealthProbe, LLMResponse, StreamChunk,
};
