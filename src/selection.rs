//! Backend selection strategies.
//!
//! Every strategy is a pure choice over the candidate list plus read-only
//! views of health and metrics. The only mutable state is the round-robin
//! cursor table, advanced under a lock so concurrent requests never
//! receive the same slot twice.
//!
//! Candidates that are disabled, excluded for the current request, or that
//! do not declare the requested model are never chosen, whatever the
//! strategy. Ties always break by priority, then registration order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::HubError;
use crate::health::{HealthMonitor, HealthState};
use crate::metrics::MetricsRegistry;
use crate::registry::RegisteredBackend;

/// How the orchestrator picks a backend among eligible candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest priority number.
    #[default]
    Priority,
    /// Rotate through the candidate set.
    RoundRobin,
    /// Lowest average response time; unmeasured backends count as 0 ms.
    LatencyOptimized,
    /// Lowest declared per-request cost; undeclared cost sorts last.
    CostOptimized,
    /// Best health band (HEALTHY, then DEGRADED, then UNHEALTHY).
    HealthBased,
    /// The primary unless it already failed for this request.
    Failover,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LatencyOptimized => "latency_optimized",
            SelectionStrategy::CostOptimized => "cost_optimized",
            SelectionStrategy::HealthBased => "health_based",
            SelectionStrategy::Failover => "failover",
        }
    }

    /// Pick one candidate.
    pub fn select<'a>(
        &self,
        candidates: &'a [RegisteredBackend],
        ctx: &SelectionContext<'_>,
    ) -> Option<&'a RegisteredBackend> {
        let mut eligible: Vec<&RegisteredBackend> =
            candidates.iter().filter(|c| ctx.is_eligible(c)).collect();
        eligible.sort_by_key(|c| (c.priority, c.seq));

        let chosen = match self {
            SelectionStrategy::Priority => eligible.first().copied(),
            SelectionStrategy::Failover => select_failover(candidates, ctx),
            SelectionStrategy::RoundRobin => {
                if eligible.is_empty() {
                    None
                } else {
                    let index = ctx.round_robin.next(&signature(&eligible), eligible.len());
                    eligible.get(index).copied()
                }
            }
            SelectionStrategy::LatencyOptimized => eligible
                .iter()
                .copied()
                .min_by(|a, b| ctx.latency(a).cmp(&ctx.latency(b))),
            SelectionStrategy::CostOptimized => eligible
                .iter()
                .copied()
                .min_by(|a, b| compare_cost(cost(a), cost(b))),
            SelectionStrategy::HealthBased => eligible
                .iter()
                .copied()
                .min_by_key(|c| ctx.health_state(c).rank()),
        };

        if let Some(c) = chosen {
            debug!(
                strategy = self.as_str(),
                backend = %c.name(),
                priority = c.priority,
                eligible = eligible.len(),
                "Selected backend"
            );
        }
        chosen
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "priority" => Ok(SelectionStrategy::Priority),
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "latency_optimized" | "latency" => Ok(SelectionStrategy::LatencyOptimized),
            "cost_optimized" | "cost" => Ok(SelectionStrategy::CostOptimized),
            "health_based" | "health" => Ok(SelectionStrategy::HealthBased),
            "failover" => Ok(SelectionStrategy::Failover),
            other => Err(HubError::Config(format!(
                "unknown selection strategy '{}'",
                other
            ))),
        }
    }
}

fn cost(c: &RegisteredBackend) -> Option<f64> {
    c.handle.capabilities().cost_per_request
}

fn compare_cost(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Primary is the best-priority candidate regardless of exclusions; once
/// it is excluded the next eligible one in priority order takes over.
fn select_failover<'a>(
    candidates: &'a [RegisteredBackend],
    ctx: &SelectionContext<'_>,
) -> Option<&'a RegisteredBackend> {
    let mut ordered: Vec<&RegisteredBackend> = candidates.iter().collect();
    ordered.sort_by_key(|c| (c.priority, c.seq));
    ordered.into_iter().find(|c| ctx.is_eligible(c))
}

fn signature(eligible: &[&RegisteredBackend]) -> String {
    eligible
        .iter()
        .map(|c| format!("{}#{}", c.name(), c.seq))
        .collect::<Vec<_>>()
        .join(",")
}

/// Rotating cursors, one per distinct candidate set.
#[derive(Debug, Default)]
pub struct RoundRobinState {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `cursor % len` for `signature` and advance the cursor.
    pub fn next(&self, signature: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(signature.to_string()).or_insert(0);
        let index = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        index
    }

    pub fn reset(&self) {
        self.cursors.lock().clear();
    }
}

/// Everything a strategy may look at besides the candidates.
pub struct SelectionContext<'a> {
    pub model: Option<&'a str>,
    pub excluded: &'a HashSet<String>,
    pub health: Option<&'a HealthMonitor>,
    pub metrics: Option<&'a MetricsRegistry>,
    pub round_robin: &'a RoundRobinState,
}

impl<'a> SelectionContext<'a> {
    pub fn new(excluded: &'a HashSet<String>, round_robin: &'a RoundRobinState) -> Self {
        Self {
            model: None,
            excluded,
            health: None,
            metrics: None,
            round_robin,
        }
    }

    pub fn with_model(mut self, model: Option<&'a str>) -> Self {
        self.model = model;
        self
    }

    pub fn with_health(mut self, health: &'a HealthMonitor) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_metrics(mut self, metrics: &'a MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn is_eligible(&self, c: &RegisteredBackend) -> bool {
        c.enabled
            && !self.excluded.contains(c.name())
            && self.model.map_or(true, |m| c.supports_model(m))
    }

    fn latency(&self, c: &RegisteredBackend) -> Duration {
        self.metrics
            .and_then(|m| m.avg_latency(c.name()))
            .or_else(|| c.handle.metrics().avg_latency)
            .unwrap_or(Duration::ZERO)
    }

    /// Unknown health counts as DEGRADED.
    fn health_state(&self, c: &RegisteredBackend) -> HealthState {
        self.health
            .and_then(|h| h.state(c.name()))
            .unwrap_or(HealthState::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::providers::MockBackend;
    use crate::registry::{BackendFilter, ProviderRegistry, RegisterOptions};
    use std::sync::Arc;

    fn registry_with(entries: &[(&str, i32)]) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        for (name, priority) in entries {
            registry
                .register(
                    Arc::new(MockBackend::new(*name)),
                    serde_json::Value::Null,
                    RegisterOptions::with_priority(*priority),
                )
                .unwrap();
        }
        registry
    }

    fn pick(
        strategy: SelectionStrategy,
        candidates: &[RegisteredBackend],
        ctx: &SelectionContext<'_>,
    ) -> Option<String> {
        strategy.select(candidates, ctx).map(|c| c.name().to_string())
    }

    #[test]
    fn test_priority_picks_lowest_number() {
        let registry = registry_with(&[("A", 2), ("B", 1), ("C", 3)]);
        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr);
        assert_eq!(pick(SelectionStrategy::Priority, &candidates, &ctx).as_deref(), Some("B"));
    }

    #[test]
    fn test_priority_ties_by_registration_order() {
        let registry = registry_with(&[("first", 1), ("second", 1)]);
        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr);
        assert_eq!(
            pick(SelectionStrategy::Priority, &candidates, &ctx).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_round_robin_cycles() {
        let registry = registry_with(&[("A", 0), ("B", 0), ("C", 0)]);
        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr);

        let picks: Vec<String> = (0..6)
            .filter_map(|_| pick(SelectionStrategy::RoundRobin, &candidates, &ctx))
            .collect();
        assert_eq!(picks, vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn test_round_robin_cursor_per_candidate_set() {
        let registry = registry_with(&[("A", 0), ("B", 0), ("C", 0)]);
        let all = registry.find(&BackendFilter::new());
        let rr = RoundRobinState::new();
        let none = HashSet::new();
        let without_a: HashSet<String> = ["A".to_string()].into_iter().collect();

        let full = SelectionContext::new(&none, &rr);
        let reduced = SelectionContext::new(&without_a, &rr);

        assert_eq!(pick(SelectionStrategy::RoundRobin, &all, &full).as_deref(), Some("A"));
        assert_eq!(pick(SelectionStrategy::RoundRobin, &all, &reduced).as_deref(), Some("B"));
        assert_eq!(pick(SelectionStrategy::RoundRobin, &all, &full).as_deref(), Some("B"));
        assert_eq!(pick(SelectionStrategy::RoundRobin, &all, &reduced).as_deref(), Some("C"));
    }

    #[test]
    fn test_failover_primary_then_secondary_then_primary() {
        let registry = registry_with(&[("primary", 1), ("secondary", 2)]);
        let candidates = registry.find(&BackendFilter::new());
        let rr = RoundRobinState::new();

        let fresh = HashSet::new();
        let ctx = SelectionContext::new(&fresh, &rr);
        assert_eq!(
            pick(SelectionStrategy::Failover, &candidates, &ctx).as_deref(),
            Some("primary")
        );

        let failed: HashSet<String> = ["primary".to_string()].into_iter().collect();
        let ctx = SelectionContext::new(&failed, &rr);
        assert_eq!(
            pick(SelectionStrategy::Failover, &candidates, &ctx).as_deref(),
            Some("secondary")
        );

        let next_request = HashSet::new();
        let ctx = SelectionContext::new(&next_request, &rr);
        assert_eq!(
            pick(SelectionStrategy::Failover, &candidates, &ctx).as_deref(),
            Some("primary")
        );
    }

    #[test]
    fn test_latency_prefers_fastest_and_samples_unmeasured() {
        let registry = registry_with(&[("slow", 0), ("fast", 1), ("new", 2)]);
        let candidates = registry.find(&BackendFilter::new());
        let metrics = MetricsRegistry::new();
        metrics.record_success("slow", Duration::from_millis(900), 0, 0);
        metrics.record_success("fast", Duration::from_millis(50), 0, 0);

        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr).with_metrics(&metrics);
        assert_eq!(
            pick(SelectionStrategy::LatencyOptimized, &candidates, &ctx).as_deref(),
            Some("new")
        );

        metrics.record_success("new", Duration::from_millis(400), 0, 0);
        assert_eq!(
            pick(SelectionStrategy::LatencyOptimized, &candidates, &ctx).as_deref(),
            Some("fast")
        );
    }

    #[test]
    fn test_cost_prefers_cheapest_missing_last() {
        let registry = ProviderRegistry::new();
        for (name, cost, priority) in [("free?", None, 0), ("pricey", Some(0.5), 1), ("cheap", Some(0.01), 2)] {
            let mut backend = MockBackend::new(name);
            if let Some(c) = cost {
                backend = backend.with_cost(c);
            }
            registry
                .register(Arc::new(backend), serde_json::Value::Null, RegisterOptions::with_priority(priority))
                .unwrap();
        }
        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr);
        assert_eq!(
            pick(SelectionStrategy::CostOptimized, &candidates, &ctx).as_deref(),
            Some("cheap")
        );
    }

    #[tokio::test]
    async fn test_health_based_bands() {
        let registry = Arc::new(registry_with(&[("sick", 0), ("unknown", 1), ("well", 2)]));
        let monitor = HealthMonitor::new(HealthConfig::default().with_failure_threshold(1), registry.clone());
        monitor.record("sick", Err("down".to_string()), Duration::ZERO);
        monitor.record("well", Ok(()), Duration::ZERO);

        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr).with_health(&monitor);
        assert_eq!(
            pick(SelectionStrategy::HealthBased, &candidates, &ctx).as_deref(),
            Some("well")
        );

        let excluded: HashSet<String> = ["well".to_string()].into_iter().collect();
        let ctx = SelectionContext::new(&excluded, &rr).with_health(&monitor);
        assert_eq!(
            pick(SelectionStrategy::HealthBased, &candidates, &ctx).as_deref(),
            Some("unknown")
        );
    }

    #[test]
    fn test_ineligible_candidates_never_chosen() {
        let registry = ProviderRegistry::new();
        registry
            .register(
                Arc::new(MockBackend::new("off")),
                serde_json::Value::Null,
                RegisterOptions::with_priority(0).disabled(),
            )
            .unwrap();
        registry
            .register(
                Arc::new(MockBackend::new("other-model").with_models(["m2"])),
                serde_json::Value::Null,
                RegisterOptions::with_priority(1),
            )
            .unwrap();
        let candidates = registry.find(&BackendFilter::new());
        let excluded = HashSet::new();
        let rr = RoundRobinState::new();
        let ctx = SelectionContext::new(&excluded, &rr).with_model(Some("m1"));

        for strategy in [
            SelectionStrategy::Priority,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::LatencyOptimized,
            SelectionStrategy::CostOptimized,
            SelectionStrategy::HealthBased,
            SelectionStrategy::Failover,
        ] {
            assert!(strategy.select(&candidates, &ctx).is_none(), "{}", strategy);
        }
    }

    #[test]
    fn test_from_str_and_display() {
        assert_eq!(
            "round-robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            "LATENCY".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LatencyOptimized
        );
        assert!("random".parse::<SelectionStrategy>().is_err());
        assert_eq!(SelectionStrategy::HealthBased.to_string(), "health_based");
    }
}
