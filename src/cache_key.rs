//! Deterministic cache keys for completion requests.
//!
//! A key is `"{prefix}:{hex digest}"` where the digest covers a canonical
//! JSON document built from the request:
//!
//! | Field | Included |
//! |-------|----------|
//! | `messages` | always |
//! | `model` | when `include_model` |
//! | `temperature` | when `include_temperature`, rounded to `temperature_precision` digits |
//! | `backend` | when `include_backend` and a backend name is given |
//!
//! Everything else (end-user id, caller metadata, max tokens) is ignored, so
//! two requests that only differ there share a cache entry. Object keys are
//! sorted recursively before hashing; array order is preserved, so reordering
//! messages changes the key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{HubError, Result};
use crate::traits::CompletionRequest;

/// Hash function used for the key digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDigest {
    #[default]
    Sha256,
    Sha512,
}

/// Configuration for [`CacheKeyGenerator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheKeyConfig {
    /// Namespace prepended to every key.
    pub prefix: String,
    /// Whether the model participates in the key.
    pub include_model: bool,
    /// Whether temperature participates in the key.
    pub include_temperature: bool,
    /// Decimal digits kept when rounding temperature.
    pub temperature_precision: u32,
    /// Whether the backend name participates in the key.
    pub include_backend: bool,
    /// Digest algorithm.
    pub digest: KeyDigest,
}

impl Default for CacheKeyConfig {
    fn default() -> Self {
        Self {
            prefix: "llm".to_string(),
            include_model: true,
            include_temperature: true,
            temperature_precision: 2,
            include_backend: false,
            digest: KeyDigest::Sha256,
        }
    }
}

impl CacheKeyConfig {
    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Include or exclude the model.
    pub fn with_model(mut self, include: bool) -> Self {
        self.include_model = include;
        self
    }

    /// Include or exclude the temperature.
    pub fn with_temperature(mut self, include: bool) -> Self {
        self.include_temperature = include;
        self
    }

    /// Set the temperature rounding precision.
    pub fn with_temperature_precision(mut self, digits: u32) -> Self {
        self.temperature_precision = digits;
        self
    }

    /// Include or exclude the backend name.
    pub fn with_backend(mut self, include: bool) -> Self {
        self.include_backend = include;
        self
    }

    /// Set the digest algorithm.
    pub fn with_digest(mut self, digest: KeyDigest) -> Self {
        self.digest = digest;
        self
    }
}

/// Maps requests to stable cache keys.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    config: CacheKeyConfig,
}

impl CacheKeyGenerator {
    pub fn new(config: CacheKeyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CacheKeyConfig {
        &self.config
    }

    /// Key for a typed request.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_hub::{CacheKeyGenerator, CompletionRequest};
    ///
    /// let keys = CacheKeyGenerator::default();
    /// let a = keys.generate(&CompletionRequest::from_prompt("hi").with_user("u1"), None).unwrap();
    /// let b = keys.generate(&CompletionRequest::from_prompt("hi").with_user("u2"), None).unwrap();
    /// assert_eq!(a, b);
    /// assert!(a.starts_with("llm:"));
    /// ```
    pub fn generate(&self, request: &CompletionRequest, backend: Option<&str>) -> Result<String> {
        let value = serde_json::to_value(request)?;
        self.generate_from_value(&value, backend)
    }

    /// Key for a request already in JSON form.
    ///
    /// Temperature is read from `temperature` or `options.temperature`.
    pub fn generate_from_value(&self, request: &Value, backend: Option<&str>) -> Result<String> {
        let messages = request
            .get("messages")
            .ok_or_else(|| HubError::Validation("request has no messages".to_string()))?;

        let mut doc = Map::new();
        doc.insert("messages".to_string(), messages.clone());

        if self.config.include_model {
            if let Some(model) = request.get("model").filter(|m| !m.is_null()) {
                doc.insert("model".to_string(), model.clone());
            }
        }

        if self.config.include_temperature {
            let temperature = request
                .get("temperature")
                .or_else(|| request.get("options").and_then(|o| o.get("temperature")))
                .and_then(Value::as_f64);
            if let Some(t) = temperature {
                doc.insert(
                    "temperature".to_string(),
                    Value::String(round_to(t, self.config.temperature_precision)),
                );
            }
        }

        if self.config.include_backend {
            if let Some(name) = backend {
                doc.insert("backend".to_string(), Value::String(name.to_string()));
            }
        }

        let canonical = serde_json::to_string(&canonicalize(&Value::Object(doc)))?;
        let digest = match self.config.digest {
            KeyDigest::Sha256 => hex::encode(Sha256::digest(canonical.as_bytes())),
            KeyDigest::Sha512 => hex::encode(Sha512::digest(canonical.as_bytes())),
        };
        Ok(format!("{}:{}", self.config.prefix, digest))
    }
}

fn round_to(value: f64, digits: u32) -> String {
    let scale = 10f64.powi(digits as i32);
    let rounded = (value * scale).round() / scale;
    format!("{:.*}", digits as usize, rounded)
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatMessage;
    use serde_json::json;

    fn keys() -> CacheKeyGenerator {
        CacheKeyGenerator::default()
    }

    #[test]
    fn test_key_format() {
        let key = keys()
            .generate(&CompletionRequest::from_prompt("hello"), None)
            .unwrap();
        let (prefix, digest) = key.split_once(':').unwrap();
        assert_eq!(prefix, "llm");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_field_order_independence() {
        let a = json!({
            "model": "gpt-4",
            "temperature": 0.7,
            "messages": [{"role": "user", "content": "hi", "name": "bob"}]
        });
        let b = json!({
            "messages": [{"name": "bob", "content": "hi", "role": "user"}],
            "temperature": 0.7,
            "model": "gpt-4"
        });
        assert_eq!(
            keys().generate_from_value(&a, None).unwrap(),
            keys().generate_from_value(&b, None).unwrap()
        );
    }

    #[test]
    fn test_message_sequence_sensitivity() {
        let forward = CompletionRequest::new(vec![ChatMessage::user("a"), ChatMessage::user("b")]);
        let reversed = CompletionRequest::new(vec![ChatMessage::user("b"), ChatMessage::user("a")]);
        assert_ne!(
            keys().generate(&forward, None).unwrap(),
            keys().generate(&reversed, None).unwrap()
        );
    }

    #[test]
    fn test_excluded_fields_do_not_change_key() {
        let base = CompletionRequest::from_prompt("q").with_model("m");
        let noisy = base
            .clone()
            .with_user("someone")
            .with_max_tokens(10)
            .with_metadata("trace", json!("abc"));
        assert_eq!(
            keys().generate(&base, None).unwrap(),
            keys().generate(&noisy, None).unwrap()
        );
    }

    #[test]
    fn test_included_fields_change_key() {
        let base = CompletionRequest::from_prompt("q").with_model("m").with_temperature(0.5);
        let k = keys().generate(&base, None).unwrap();

        let other_model = base.clone().with_model("n");
        assert_ne!(k, keys().generate(&other_model, None).unwrap());

        let other_temp = base.clone().with_temperature(0.9);
        assert_ne!(k, keys().generate(&other_temp, None).unwrap());
    }

    #[test]
    fn test_temperature_rounding() {
        let a = CompletionRequest::from_prompt("q").with_temperature(0.701);
        let b = CompletionRequest::from_prompt("q").with_temperature(0.699);
        assert_eq!(
            keys().generate(&a, None).unwrap(),
            keys().generate(&b, None).unwrap()
        );

        let fine = CacheKeyGenerator::new(CacheKeyConfig::default().with_temperature_precision(3));
        assert_ne!(
            fine.generate(&a, None).unwrap(),
            fine.generate(&b, None).unwrap()
        );
    }

    #[test]
    fn test_model_excluded_when_configured() {
        let gen = CacheKeyGenerator::new(CacheKeyConfig::default().with_model(false));
        let a = CompletionRequest::from_prompt("q").with_model("m1");
        let b = CompletionRequest::from_prompt("q").with_model("m2");
        assert_eq!(gen.generate(&a, None).unwrap(), gen.generate(&b, None).unwrap());
    }

    #[test]
    fn test_backend_name_only_when_included() {
        let request = CompletionRequest::from_prompt("q");
        assert_eq!(
            keys().generate(&request, Some("a")).unwrap(),
            keys().generate(&request, Some("b")).unwrap()
        );

        let gen = CacheKeyGenerator::new(CacheKeyConfig::default().with_backend(true));
        assert_ne!(
            gen.generate(&request, Some("a")).unwrap(),
            gen.generate(&request, Some("b")).unwrap()
        );
    }

    #[test]
    fn test_prefix_and_sha512() {
        let gen = CacheKeyGenerator::new(
            CacheKeyConfig::default()
                .with_prefix("cache:chat")
                .with_digest(KeyDigest::Sha512),
        );
        let key = gen.generate(&CompletionRequest::from_prompt("q"), None).unwrap();
        assert!(key.starts_with("cache:chat:"));
        assert_eq!(key.rsplit(':').next().unwrap().len(), 128);
    }

    #[test]
    fn test_missing_messages_is_validation_error() {
        let err = keys().generate_from_value(&json!({"model": "m"}), None).unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn test_canonicalize_nested() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": 0});
        let text = serde_json::to_string(&canonicalize(&value)).unwrap();
        assert_eq!(text, r#"{"a":0,"b":{"a":[{"x":1,"y":2}],"z":1}}"#);
    }
}
