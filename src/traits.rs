//! Backend trait and the request/response types that flow through the hub.
//!
//! # Why a trait
//!
//! Every backend adapter (OpenAI, Anthropic, a local server, a test double)
//! implements [`Backend`]. The orchestrator only ever holds
//! `Arc<dyn Backend>`, so adapters can be swapped, replicated and mocked
//! without touching selection, caching or fallback logic.
//!
//! # Key Types
//!
//! - [`CompletionRequest`]: normalized request (messages, model, options)
//! - [`LLMResponse`]: completion result with token usage
//! - [`StreamChunk`]: incremental streaming output
//! - [`BackendCapabilities`]: declared models, streaming support and cost
//! - [`HealthProbe`]: result of a backend's own health check

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{HubError, Result};

// ============================================================================
// Messages
// ============================================================================

/// Who authored a [`ChatMessage`]. Serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    /// Output of a tool invocation fed back to the model.
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Participant name; part of the cache key when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::Tool, content)
    }

    /// Set the sender name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Sampling options for a completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Completion budget; also feeds rate-limit token estimates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    /// Temperature for sampling (0.0 = deterministic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling mass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Normalized completion request accepted by every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,

    /// Requested model. `None` lets the selected backend use its default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Sampling options.
    #[serde(default)]
    pub options: CompletionOptions,

    /// End-user identifier, forwarded to backends for abuse tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Free-form caller metadata. Never part of the cache key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    /// Create a request from a list of messages.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Single user-message request.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(prompt)])
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Set the max tokens.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    /// Set the end-user identifier.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Structural validation only; content is never inspected.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(HubError::Validation(
                "request must contain at least one message".to_string(),
            ));
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(HubError::Validation("model must not be blank".to_string()));
            }
        }
        if let Some(t) = self.options.temperature {
            if !t.is_finite() || t < 0.0 {
                return Err(HubError::Validation(format!(
                    "temperature must be a non-negative number, got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.options.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(HubError::Validation(format!(
                    "top_p must be within [0, 1], got {}",
                    p
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A completed answer as returned by a backend or the response cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    /// Always `prompt_tokens + completion_tokens` when built via
    /// [`LLMResponse::with_usage`].
    pub total_tokens: usize,
    /// Model that actually answered, which may differ from the one requested.
    pub model: String,

    /// Finish reason (e.g., "stop", "length").
    pub finish_reason: Option<String>,

    /// Additional metadata from the backend or the hub.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LLMResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            model: model.into(),
            finish_reason: None,
            metadata: HashMap::new(),
        }
    }

    /// Record usage; the total is derived.
    pub fn with_usage(mut self, prompt: usize, completion: usize) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self.total_tokens = prompt + completion;
        self
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Chunk of a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Partial content text.
    Content(String),

    /// Terminal chunk.
    Finished {
        /// Finish reason (e.g., "stop", "length").
        reason: String,
    },
}

// ============================================================================
// Capabilities, health and metrics
// ============================================================================

/// What a backend declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Supported model identifiers. Empty means any model is accepted.
    #[serde(default)]
    pub models: Vec<String>,

    /// Whether `call_streaming` is implemented.
    #[serde(default)]
    pub streaming: bool,

    /// Maximum context length in tokens, if known.
    #[serde(default)]
    pub max_context_length: Option<usize>,

    /// Declared cost of one request, in the operator's currency unit.
    #[serde(default)]
    pub cost_per_request: Option<f64>,
}

impl BackendCapabilities {
    /// Capabilities restricted to the given models.
    pub fn with_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the per-request cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_request = Some(cost);
        self
    }

    /// Mark streaming as supported.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Check if the backend serves `model`.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

/// Outcome of a backend's own health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthProbe {
    /// Whether the backend considers itself healthy.
    pub healthy: bool,

    /// Optional human-readable detail.
    pub message: Option<String>,
}

impl HealthProbe {
    /// Healthy probe.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    /// Unhealthy probe with a reason.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Metrics a backend reports about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMetrics {
    /// Average response time, if the backend tracks it.
    pub avg_latency: Option<Duration>,

    /// Requests served.
    pub total_requests: u64,

    /// Requests failed.
    pub failed_requests: u64,
}

// ============================================================================
// Backend trait
// ============================================================================

/// An interchangeable service implementing the completion capability.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name. Registrations with the same name form a replica pool.
    fn name(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Run a completion.
    async fn call(&self, request: &CompletionRequest) -> Result<LLMResponse>;

    /// Run a streaming completion.
    async fn call_streaming(
        &self,
        _request: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        Err(HubError::NotSupported(format!(
            "streaming on backend '{}'",
            self.name()
        )))
    }

    /// Cheap liveness check used by the health monitor.
    async fn health_probe(&self) -> Result<HealthProbe> {
        Ok(HealthProbe::healthy())
    }

    /// Self-reported metrics.
    fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }
}
