//! Middleware pipeline wrapped around every backend attempt.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Backend Attempt Pipeline                  │
//! │                                                              │
//! │  ctx ──► [mw prio 0] ──► [mw prio 10] ──► ... ──► Backend   │
//! │              │next.run()      │next.run()          .call()   │
//! │              ▼                ▼                       │      │
//! │  result ◄── [mw prio 0] ◄── [mw prio 10] ◄── ... ◄────┘      │
//! │              on_error()       on_error()                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries run in ascending priority; the lowest number is outermost.
//! Each middleware receives a [`Next`] cursor and decides whether to call
//! further down, transform the result, or answer on its own. When a
//! middleware's `process` fails, its `on_error` hook may recover with a
//! response before the error unwinds to the outer layers.
//!
//! # Example
//! ```ignore
//! let pipeline = MiddlewarePipeline::new();
//! pipeline.add(Arc::new(LoggingMiddleware::new()), 0).await?;
//! pipeline.add(Arc::new(RetryMiddleware::new()), 10).await?;
//!
//! let mut ctx = MiddlewareContext::new(request, "openai", 1);
//! let response = pipeline.execute(&mut ctx, backend.as_ref(), Some(timeout)).await?;
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{HubError, Result};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::traits::{Backend, CompletionRequest, LLMResponse};

// ============================================================================
// Context
// ============================================================================

/// State shared by the middleware chain for one backend attempt.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    /// Identifier of the logical request, stable across attempts.
    pub request_id: String,
    /// The request sent to the backend. Middleware may rewrite it.
    pub request: CompletionRequest,
    /// Backend this attempt targets.
    pub backend_name: String,
    /// Free-form values middleware pass to each other.
    pub metadata: HashMap<String, serde_json::Value>,
    pub started_at: Instant,
    /// 1-based fallback attempt within the logical request.
    pub attempt: u32,
    /// Display form of the most recent failure seen in this chain.
    pub last_error: Option<String>,
}

impl MiddlewareContext {
    pub fn new(request: CompletionRequest, backend_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request,
            backend_name: backend_name.into(),
            metadata: HashMap::new(),
            started_at: Instant::now(),
            attempt,
            last_error: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Fresh context for a same-backend retry. Only the request and its
    /// identity carry over.
    pub fn for_retry(&self, retry: u32, last_error: Option<String>) -> Self {
        let mut ctx = Self::new(self.request.clone(), self.backend_name.clone(), self.attempt)
            .with_request_id(self.request_id.clone());
        ctx.metadata
            .insert("retry_attempt".to_string(), serde_json::json!(retry));
        ctx.last_error = last_error;
        ctx
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

// ============================================================================
// Middleware trait and cursor
// ============================================================================

/// Cross-cutting handler invoked around backend calls.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Called once when added to a pipeline.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Handle the attempt, usually by calling `next.run(ctx)`.
    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse>;

    /// Chance to turn this layer's failure into a response.
    async fn on_error(
        &self,
        ctx: &mut MiddlewareContext,
        error: &HubError,
    ) -> Option<LLMResponse> {
        let _ = (ctx, error);
        None
    }

    /// Called when removed from a pipeline or on hub shutdown.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Cursor over the remaining middleware; the end of the chain is the
/// backend call itself.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    backend: &'a dyn Backend,
    timeout: Option<Duration>,
}

impl<'a> Next<'a> {
    pub fn new(
        middlewares: &'a [Arc<dyn Middleware>],
        backend: &'a dyn Backend,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            middlewares,
            backend,
            timeout,
        }
    }

    /// Name of the backend at the end of the chain.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Run the rest of the chain.
    ///
    /// `Next` is `Copy`, so a middleware may call this more than once.
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<LLMResponse> {
        let Some((current, rest)) = self.middlewares.split_first() else {
            return self.call_backend(ctx).await;
        };

        let next = Next {
            middlewares: rest,
            ..self
        };
        match current.process(ctx, next).await {
            Ok(response) => Ok(response),
            Err(error) => {
                ctx.last_error = Some(error.to_string());
                match current.on_error(ctx, &error).await {
                    Some(response) => {
                        debug!(
                            middleware = current.name(),
                            backend = %ctx.backend_name,
                            error = %error,
                            "Middleware recovered from error"
                        );
                        Ok(response)
                    }
                    None => Err(error),
                }
            }
        }
    }

    async fn call_backend(&self, ctx: &mut MiddlewareContext) -> Result<LLMResponse> {
        let call = self.backend.call(&ctx.request);
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(HubError::Timeout {
                    backend: self.backend.name().to_string(),
                    timeout: limit,
                }),
            },
            None => call.await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.middlewares.len())
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct PipelineEntry {
    middleware: Arc<dyn Middleware>,
    priority: i32,
    enabled: bool,
    seq: u64,
}

/// Priority-ordered middleware chain, editable at runtime.
#[derive(Default)]
pub struct MiddlewarePipeline {
    entries: RwLock<Vec<PipelineEntry>>,
    next_seq: AtomicU64,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize and insert `middleware`.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] if the name is taken, or whatever `initialize`
    /// returned.
    pub async fn add(&self, middleware: Arc<dyn Middleware>, priority: i32) -> Result<()> {
        let name = middleware.name().to_string();
        if self.contains(&name) {
            return Err(HubError::Config(format!(
                "middleware '{}' is already registered",
                name
            )));
        }

        middleware.initialize().await?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.middleware.name() == name) {
            return Err(HubError::Config(format!(
                "middleware '{}' is already registered",
                name
            )));
        }
        entries.push(PipelineEntry {
            middleware,
            priority,
            enabled: true,
            seq,
        });
        entries.sort_by_key(|e| (e.priority, e.seq));
        debug!(middleware = %name, priority, "Middleware added");
        Ok(())
    }

    /// Remove `name` and run its cleanup. Returns false if absent.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            entries
                .iter()
                .position(|e| e.middleware.name() == name)
                .map(|i| entries.remove(i))
        };
        let Some(entry) = removed else {
            return false;
        };
        if let Err(e) = entry.middleware.cleanup().await {
            warn!(middleware = %name, error = %e, "Middleware cleanup failed");
        }
        debug!(middleware = %name, "Middleware removed");
        true
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.middleware.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.middleware.name() == name)
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.entries
            .read()
            .iter()
            .find(|e| e.middleware.name() == name)
            .map(|e| e.enabled)
    }

    /// Names in execution order, disabled ones included.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.middleware.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run the enabled chain around `backend.call`.
    ///
    /// The chain is snapshotted first, so edits made while a request is in
    /// flight apply to the next request.
    pub async fn execute(
        &self,
        ctx: &mut MiddlewareContext,
        backend: &dyn Backend,
        timeout: Option<Duration>,
    ) -> Result<LLMResponse> {
        let chain: Vec<Arc<dyn Middleware>> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.middleware.clone())
            .collect();

        Next::new(&chain, backend, timeout).run(ctx).await
    }

    /// Run every middleware's cleanup, keeping them registered.
    pub async fn cleanup_all(&self) {
        let all: Vec<Arc<dyn Middleware>> = self
            .entries
            .read()
            .iter()
            .map(|e| e.middleware.clone())
            .collect();
        for middleware in all {
            if let Err(e) = middleware.cleanup().await {
                warn!(middleware = middleware.name(), error = %e, "Middleware cleanup failed");
            }
        }
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middlewares", &self.names())
            .finish()
    }
}

// ============================================================================
// Built-in: logging
// ============================================================================

/// Log level for logging middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Minimal logging (request/response summary).
    #[default]
    Info,
    /// Detailed logging (includes message previews).
    Debug,
    /// Full logging (complete messages and responses).
    Trace,
}

/// Logs each attempt and its outcome.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    log_level: LogLevel,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: LogLevel) -> Self {
        Self { log_level: level }
    }

    pub fn level(&self) -> LogLevel {
        self.log_level
    }

    fn log_request(&self, ctx: &MiddlewareContext) {
        let model = ctx.request.model.as_deref().unwrap_or("default");
        match self.log_level {
            LogLevel::Info => {
                info!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    model,
                    attempt = ctx.attempt,
                    messages = ctx.request.messages.len(),
                    "[LLM] Request"
                );
            }
            LogLevel::Debug => {
                let last_msg = ctx
                    .request
                    .messages
                    .last()
                    .map(|m| format!("[{}] {}", m.role.as_str(), preview(&m.content, 100)));
                debug!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    model,
                    attempt = ctx.attempt,
                    messages = ctx.request.messages.len(),
                    last_message = ?last_msg,
                    "[LLM] Request"
                );
            }
            LogLevel::Trace => {
                trace!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    request = ?ctx.request,
                    "[LLM] Full request"
                );
            }
        }
    }

    fn log_response(&self, ctx: &MiddlewareContext, response: &LLMResponse, duration_ms: u64) {
        match self.log_level {
            LogLevel::Info => {
                info!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    tokens = response.total_tokens,
                    duration_ms,
                    finish_reason = ?response.finish_reason,
                    "[LLM] Response"
                );
            }
            LogLevel::Debug => {
                debug!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    tokens = response.total_tokens,
                    duration_ms,
                    content_preview = %preview(&response.content, 200),
                    "[LLM] Response"
                );
            }
            LogLevel::Trace => {
                trace!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    response = ?response,
                    "[LLM] Full response"
                );
            }
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse> {
        self.log_request(ctx);
        let start = Instant::now();
        let result = next.run(ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => self.log_response(ctx, response, duration_ms),
            Err(e) => warn!(
                request_id = %ctx.request_id,
                backend = %ctx.backend_name,
                duration_ms,
                error = %e,
                "[LLM] Request failed"
            ),
        }
        result
    }
}

// ============================================================================
// Built-in: metrics
// ============================================================================

/// Counts attempts, failures, tokens and time spent below this layer.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_time_ms: AtomicU64,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> MetricsSummary {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        MetricsSummary {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens,
            completion_tokens,
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.failed_requests,
            &self.prompt_tokens,
            &self.completion_tokens,
            &self.total_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = next.run(ctx).await;
        self.total_time_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        match &result {
            Ok(response) => {
                self.prompt_tokens
                    .fetch_add(response.prompt_tokens as u64, Ordering::Relaxed);
                self.completion_tokens
                    .fetch_add(response.completion_tokens as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Point-in-time copy of [`MetricsMiddleware`] counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_time_ms: u64,
}

impl MetricsSummary {
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.total_requests as f64
        }
    }

    /// Average tokens per successful request.
    pub fn average_tokens_per_request(&self) -> f64 {
        let succeeded = self.total_requests.saturating_sub(self.failed_requests);
        if succeeded == 0 {
            0.0
        } else {
            self.total_tokens as f64 / succeeded as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    /// Completion tokens generated per second of backend time.
    pub fn output_tokens_per_second(&self) -> f64 {
        if self.total_time_ms == 0 {
            return 0.0;
        }
        self.completion_tokens as f64 / (self.total_time_ms as f64 / 1000.0)
    }
}

/// Compact single-line form for logs:
/// `reqs=10 failed=1 tokens=5000/1000 latency=150ms tps=66.7`
impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqs={} failed={} tokens={}/{} latency={:.0}ms tps={:.1}",
            self.total_requests,
            self.failed_requests,
            self.prompt_tokens,
            self.completion_tokens,
            self.average_latency_ms(),
            self.output_tokens_per_second()
        )
    }
}

// ============================================================================
// Built-in: retry
// ============================================================================

/// Retries the rest of the chain on the same backend, following each
/// error's [`RetryStrategy`](crate::error::RetryStrategy).
///
/// Every retry runs with a fresh context built by
/// [`MiddlewareContext::for_retry`].
#[derive(Debug)]
pub struct RetryMiddleware {
    executor: RetryExecutor,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryMiddleware {
    pub fn new() -> Self {
        Self {
            executor: RetryExecutor::new(),
        }
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            executor: RetryExecutor::new().with_policy(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.executor.policy()
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse> {
        let last_error: Mutex<Option<String>> = Mutex::new(ctx.last_error.clone());
        let base: &MiddlewareContext = ctx;

        let result = self
            .executor
            .execute_auto(|retry| {
                let mut attempt_ctx = base.for_retry(retry, last_error.lock().clone());
                let last_error = &last_error;
                async move {
                    let outcome = next.run(&mut attempt_ctx).await;
                    if let Err(e) = &outcome {
                        *last_error.lock() = Some(e.to_string());
                    }
                    outcome
                }
            })
            .await;

        ctx.last_error = last_error.into_inner();
        result
    }
}

// ============================================================================
// Built-in: rate limiting
// ============================================================================

/// What [`RateLimitMiddleware`] does when the limiter is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Wait for capacity.
    #[default]
    Wait,
    /// Fail with [`HubError::RateLimited`].
    FailFast,
}

/// Applies a [`RateLimiter`] in front of the rest of the chain.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    mode: RateLimitMode,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config),
            mode: RateLimitMode::Wait,
        }
    }

    pub fn with_mode(mut self, mode: RateLimitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Rough token estimate: four characters per token plus the
    /// completion budget.
    fn estimate_tokens(request: &CompletionRequest) -> usize {
        let chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        chars / 4 + request.options.max_tokens.unwrap_or(0)
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn initialize(&self) -> Result<()> {
        self.limiter.config().validate()
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse> {
        let estimate = Self::estimate_tokens(&ctx.request);
        let _guard = match self.mode {
            RateLimitMode::Wait => self.limiter.acquire(estimate).await?,
            RateLimitMode::FailFast => self.limiter.try_acquire(estimate)?,
        };

        let result = next.run(ctx).await;
        if let Ok(response) = &result {
            self.limiter.record_usage(response.total_tokens, estimate);
        }
        result
    }
}

// ============================================================================
// Built-in: timeout
// ============================================================================

/// Deadline for everything below this layer, tighter than the hub-wide
/// per-call timeout.
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn initialize(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(HubError::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<LLMResponse> {
        match tokio::time::timeout(self.timeout, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout {
                backend: ctx.backend_name.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
