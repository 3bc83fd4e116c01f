//! Scriptable in-memory backend for tests and demos.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ MockBackend                                      │
//! ├──────────────────────────────────────────────────┤
//! │ add_response() / add_error()   scripted queue    │
//! │ fail_always() / recover()      failure injection │
//! │ set_latency()                  slow calls        │
//! │ set_healthy() / set_probe_delay()  health probe  │
//! │ call_count() / requests()      call recording    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Scripted entries are consumed first. With an empty queue the backend
//! either fails (after [`MockBackend::fail_always`]) or answers
//! `"response from <name>"`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{HubError, Result};
use crate::traits::{
    Backend, BackendCapabilities, BackendMetrics, CompletionRequest, HealthProbe, LLMResponse,
    StreamChunk,
};

/// A queued outcome.
#[derive(Debug)]
enum Scripted {
    Respond(LLMResponse),
    Fail(HubError),
}

/// Mock backend for testing.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    capabilities: BackendCapabilities,
    script: Mutex<VecDeque<Scripted>>,
    failing: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    reported_latency: Option<Duration>,
    healthy: AtomicBool,
    probe_delay: Mutex<Duration>,
    calls: AtomicU64,
    failures: AtomicU64,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BackendCapabilities::default(),
            script: Mutex::new(VecDeque::new()),
            failing: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            reported_latency: None,
            healthy: AtomicBool::new(true),
            probe_delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Restrict the models this backend declares.
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.capabilities.cost_per_request = Some(cost);
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.capabilities.streaming = true;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Average latency reported through [`Backend::metrics`].
    pub fn with_reported_latency(mut self, latency: Duration) -> Self {
        self.reported_latency = Some(latency);
        self
    }

    /// Queue a successful answer with the given content.
    pub fn add_response(&self, content: impl Into<String>) {
        let response = LLMResponse::new(content, "mock-model")
            .with_usage(10, 5)
            .with_finish_reason("stop");
        self.script.lock().push_back(Scripted::Respond(response));
    }

    pub fn add_llm_response(&self, response: LLMResponse) {
        self.script.lock().push_back(Scripted::Respond(response));
    }

    /// Queue a failure for the next call.
    pub fn add_error(&self, error: HubError) {
        self.script.lock().push_back(Scripted::Fail(error));
    }

    /// Fail every unscripted call with a retryable backend error.
    pub fn fail_always(&self, message: impl Into<String>) {
        *self.failing.lock() = Some(message.into());
    }

    pub fn recover(&self) {
        *self.failing.lock() = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Calls made so far, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }

    fn default_response(&self, request: &CompletionRequest) -> LLMResponse {
        let model = request.model.as_deref().unwrap_or("mock-model");
        LLMResponse::new(format!("response from {}", self.name), model)
            .with_usage(10, 5)
            .with_finish_reason("stop")
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    async fn call(&self, request: &CompletionRequest) -> Result<LLMResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().pop_front();
        let outcome = match scripted {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            None => match self.failing.lock().clone() {
                Some(message) => Err(HubError::backend(&self.name, message)),
                None => Ok(self.default_response(request)),
            },
        };
        if outcome.is_err() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        outcome
    }

    async fn call_streaming(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        if !self.capabilities.streaming {
            return Err(HubError::NotSupported(format!(
                "streaming on backend '{}'",
                self.name
            )));
        }

        let response = self.call(request).await?;
        let mut chunks: Vec<Result<StreamChunk>> = response
            .content
            .split_inclusive(' ')
            .map(|piece| Ok(StreamChunk::Content(piece.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Finished {
            reason: response.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }));
        Ok(stream::iter(chunks).boxed())
    }

    async fn health_probe(&self) -> Result<HealthProbe> {
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthProbe::healthy())
        } else {
            Ok(HealthProbe::unhealthy("mock backend marked unhealthy"))
        }
    }

    fn metrics(&self) -> BackendMetrics {
        BackendMetrics {
            avg_latency: self.reported_latency,
            total_requests: self.calls.load(Ordering::SeqCst),
            failed_requests: self.failures.load(Ordering::SeqCst),
        }
    }
}
