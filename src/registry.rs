//! Provider registry: pluggable backend management.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ProviderRegistry                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  openai    → [ replica#0 (p=1), replica#1 (p=1) ]           │
//! │  anthropic → [ replica#0 (p=2) ]                            │
//! │  ollama    → [ replica#0 (p=5, enabled=false) ]             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Registering an existing name appends a replica instead of replacing the
//! entry. Replicas of one name are kept sorted by priority, then by
//! registration order, so index 0 is always the preferred replica.
//!
//! The registry is a pure in-memory index. It never calls a backend.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::traits::Backend;

/// A backend handle plus the metadata the hub tracks about it.
#[derive(Clone)]
pub struct RegisteredBackend {
    /// The backend itself.
    pub handle: Arc<dyn Backend>,

    /// Opaque backend-specific settings supplied at registration.
    pub config: serde_json::Value,

    /// Disabled backends are skipped by selection.
    pub enabled: bool,

    /// Lower is preferred.
    pub priority: i32,

    /// Free-form labels used by [`BackendFilter::with_tag`].
    pub tags: HashSet<String>,

    /// When the backend was registered.
    pub registered_at: Instant,

    /// Last time a request was successfully served by this replica.
    pub last_used_at: Option<Instant>,

    /// Registry-wide registration sequence number.
    pub seq: u64,
}

impl RegisteredBackend {
    /// Backend name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Check if the backend declares support for `model`.
    pub fn supports_model(&self, model: &str) -> bool {
        self.handle.capabilities().supports_model(model)
    }
}

impl fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("name", &self.name())
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Options for [`ProviderRegistry::register`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Lower is preferred.
    pub priority: i32,
    /// Labels attached to the registration.
    pub tags: HashSet<String>,
    /// Whether the backend starts enabled.
    pub enabled: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            tags: HashSet::new(),
            enabled: true,
        }
    }
}

impl RegisterOptions {
    /// Default options with the given priority.
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Register disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Query for [`ProviderRegistry::find`].
///
/// All set criteria must match. Tags match when the registration carries
/// every listed tag.
#[derive(Debug, Clone, Default)]
pub struct BackendFilter {
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub model: Option<String>,
    pub enabled_only: bool,
    pub exclude: HashSet<String>,
}

impl BackendFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn enabled_only(mut self) -> Self {
        self.enabled_only = true;
        self
    }

    /// Skip every registration of the named backends.
    pub fn excluding<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    fn matches(&self, entry: &RegisteredBackend) -> bool {
        if self.enabled_only && !entry.enabled {
            return false;
        }
        if let Some(name) = &self.name {
            if entry.name() != name {
                return false;
            }
        }
        if self.exclude.contains(entry.name()) {
            return false;
        }
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(model) = &self.model {
            if !entry.supports_model(model) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, Vec<RegisteredBackend>>,
    next_seq: u64,
}

/// Registry of backends keyed by name.
///
/// Interior mutability lets the orchestrator and the health monitor share
/// one `Arc<ProviderRegistry>`.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, appending a replica if the name is taken.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if the backend name is empty.
    pub fn register(
        &self,
        backend: Arc<dyn Backend>,
        config: serde_json::Value,
        options: RegisterOptions,
    ) -> Result<RegisteredBackend> {
        let name = backend.name().to_string();
        if name.trim().is_empty() {
            return Err(HubError::Config("backend name must not be empty".to_string()));
        }

        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = RegisteredBackend {
            handle: backend,
            config,
            enabled: options.enabled,
            priority: options.priority,
            tags: options.tags,
            registered_at: Instant::now(),
            last_used_at: None,
            seq,
        };

        let replicas = inner.by_name.entry(name.clone()).or_default();
        replicas.push(entry.clone());
        replicas.sort_by_key(|e| (e.priority, e.seq));

        debug!(
            backend = %name,
            priority = entry.priority,
            replicas = replicas.len(),
            "Registered backend"
        );
        Ok(entry)
    }

    /// Get the `index`-th replica of `name` (0 is the preferred one).
    pub fn get(&self, name: &str, index: usize) -> Option<Arc<dyn Backend>> {
        self.get_entry(name, index).map(|e| e.handle)
    }

    /// Get a snapshot of the `index`-th registration of `name`.
    pub fn get_entry(&self, name: &str, index: usize) -> Option<RegisteredBackend> {
        self.inner
            .read()
            .by_name
            .get(name)
            .and_then(|v| v.get(index))
            .cloned()
    }

    /// Find registrations matching `filter`, sorted by priority then
    /// registration order.
    pub fn find(&self, filter: &BackendFilter) -> Vec<RegisteredBackend> {
        let inner = self.inner.read();
        let mut found: Vec<RegisteredBackend> = inner
            .by_name
            .values()
            .flatten()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.priority, e.seq));
        found
    }

    /// Record that the `index`-th replica of `name` served a request.
    ///
    /// Returns `false` (and changes nothing) if there is no such replica.
    pub fn mark_used(&self, name: &str, index: usize) -> bool {
        self.mark_used_where(name, |i, _| i == index)
    }

    /// Record use of the registration with the given sequence number.
    pub fn mark_used_seq(&self, name: &str, seq: u64) -> bool {
        self.mark_used_where(name, |_, e| e.seq == seq)
    }

    fn mark_used_where(
        &self,
        name: &str,
        pred: impl Fn(usize, &RegisteredBackend) -> bool,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(replicas) = inner.by_name.get_mut(name) else {
            return false;
        };
        match replicas.iter_mut().enumerate().find(|(i, e)| pred(*i, e)) {
            Some((_, entry)) => {
                entry.last_used_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Enable or disable registrations of `name`.
    ///
    /// With `index = None` every replica is toggled. Returns the number of
    /// registrations whose flag actually changed.
    pub fn set_enabled(&self, name: &str, index: Option<usize>, enabled: bool) -> usize {
        let mut inner = self.inner.write();
        let Some(replicas) = inner.by_name.get_mut(name) else {
            return 0;
        };
        let mut changed = 0;
        for (i, entry) in replicas.iter_mut().enumerate() {
            if index.is_some_and(|want| want != i) {
                continue;
            }
            if entry.enabled != enabled {
                entry.enabled = enabled;
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(backend = %name, enabled, changed, "Backend enablement changed");
        }
        changed
    }

    /// Enable every replica of `name`.
    pub fn enable(&self, name: &str) -> usize {
        self.set_enabled(name, None, true)
    }

    /// Disable every replica of `name`.
    pub fn disable(&self, name: &str) -> usize {
        self.set_enabled(name, None, false)
    }

    /// Check if any replica of `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// Remove every replica of `name`, returning how many were removed.
    pub fn remove(&self, name: &str) -> usize {
        self.inner
            .write()
            .by_name
            .remove(name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Sorted list of registered names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of registrations, replicas included.
    pub fn count(&self) -> usize {
        self.inner.read().by_name.values().map(Vec::len).sum()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_name.is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.write().by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;
    use serde_json::json;

    fn mock(name: &str) -> Arc<dyn Backend> {
        Arc::new(MockBackend::new(name))
    }

    #[test]
    fn test_registry_default_is_empty() {
        let registry = ProviderRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.count(), 0);
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_register_and_get() {
        let registry = ProviderRegistry::new();
        let entry = registry
            .register(mock("openai"), json!({"region": "eu"}), RegisterOptions::default())
            .unwrap();

        assert_eq!(entry.name(), "openai");
        assert!(entry.enabled);
        assert!(entry.last_used_at.is_none());
        assert!(registry.has("openai"));
        assert_eq!(registry.get("openai", 0).unwrap().name(), "openai");
        assert_eq!(registry.get_entry("openai", 0).unwrap().config["region"], "eu");
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let registry = ProviderRegistry::new();
        let err = registry
            .register(mock(""), json!(null), RegisterOptions::default())
            .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_nonexistent() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nope", 0).is_none());
        registry
            .register(mock("a"), json!(null), RegisterOptions::default())
            .unwrap();
        assert!(registry.get("a", 1).is_none());
    }

    #[test]
    fn test_same_name_appends_replica_ordered_by_priority() {
        let registry = ProviderRegistry::new();
        let first = registry
            .register(mock("pool"), json!(1), RegisterOptions::with_priority(5))
            .unwrap();
        let second = registry
            .register(mock("pool"), json!(2), RegisterOptions::with_priority(1))
            .unwrap();
        let third = registry
            .register(mock("pool"), json!(3), RegisterOptions::with_priority(5))
            .unwrap();

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.names(), vec!["pool".to_string()]);
        assert_eq!(registry.get_entry("pool", 0).unwrap().seq, second.seq);
        assert_eq!(registry.get_entry("pool", 1).unwrap().seq, first.seq);
        assert_eq!(registry.get_entry("pool", 2).unwrap().seq, third.seq);
    }

    #[test]
    fn test_find_sorted_by_priority_then_registration() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a"), json!(null), RegisterOptions::with_priority(2)).unwrap();
        registry.register(mock("b"), json!(null), RegisterOptions::with_priority(1)).unwrap();
        registry.register(mock("c"), json!(null), RegisterOptions::with_priority(2)).unwrap();

        let names: Vec<String> = registry
            .find(&BackendFilter::new())
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_find_filters() {
        let registry = ProviderRegistry::new();
        registry
            .register(
                Arc::new(MockBackend::new("gpt").with_models(["gpt-4"])),
                json!(null),
                RegisterOptions::default().tag("cloud"),
            )
            .unwrap();
        registry
            .register(
                Arc::new(MockBackend::new("local").with_models(["llama3"])),
                json!(null),
                RegisterOptions::default().tag("local").disabled(),
            )
            .unwrap();
        registry
            .register(mock("any"), json!(null), RegisterOptions::default().tag("cloud"))
            .unwrap();

        let by_model = registry.find(&BackendFilter::new().model("gpt-4"));
        let names: Vec<&str> = by_model.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["gpt", "any"]);

        assert!(registry
            .find(&BackendFilter::new().model("llama3").enabled_only())
            .iter()
            .all(|e| e.name() == "any"));

        let cloud = registry.find(&BackendFilter::new().with_tag("cloud").excluding(["any"]));
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud[0].name(), "gpt");

        assert_eq!(registry.find(&BackendFilter::new().name("local")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_used_sets_timestamp() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();

        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        assert!(registry.mark_used("a", 0));

        let entry = registry.get_entry("a", 0).unwrap();
        let used = entry.last_used_at.unwrap();
        assert!(used > entry.registered_at);
    }

    #[test]
    fn test_mark_used_missing_is_noop() {
        let registry = ProviderRegistry::new();
        assert!(!registry.mark_used("ghost", 0));
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();
        assert!(!registry.mark_used("a", 4));
        assert!(registry.get_entry("a", 0).unwrap().last_used_at.is_none());
    }

    #[test]
    fn test_set_enabled_single_replica_and_all() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();

        assert_eq!(registry.set_enabled("a", Some(1), false), 1);
        assert!(registry.get_entry("a", 0).unwrap().enabled);
        assert!(!registry.get_entry("a", 1).unwrap().enabled);

        assert_eq!(registry.disable("a"), 1);
        assert_eq!(registry.enable("a"), 2);
        assert_eq!(registry.enable("missing"), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();
        registry.register(mock("a"), json!(null), RegisterOptions::default()).unwrap();
        registry.register(mock("b"), json!(null), RegisterOptions::default()).unwrap();

        assert_eq!(registry.remove("a"), 2);
        assert_eq!(registry.remove("a"), 0);
        assert_eq!(registry.count(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_debug_does_not_require_backend_debug() {
        let registry = ProviderRegistry::new();
        let entry = registry
            .register(mock("dbg"), json!(null), RegisterOptions::with_priority(3))
            .unwrap();
        let text = format!("{:?}", entry);
        assert!(text.contains("dbg"));
        assert!(text.contains("priority: 3"));
    }
}
