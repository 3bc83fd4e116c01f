//! Per-backend call accounting kept by the hub.
//!
//! Latency-optimized selection reads averages from here. The orchestrator
//! records one entry per attempt, so a request that falls back twice adds
//! two failures and one success.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one backend name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendCallStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Sum of successful call latencies.
    pub total_latency: Duration,
    pub last_latency: Option<Duration>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl BackendCallStats {
    /// Mean latency of successful calls.
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.successes == 0 {
            return None;
        }
        Some(self.total_latency / self.successes as u32)
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

/// Hub-wide metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    backends: DashMap<String, BackendCallStats>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallbacks: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(
        &self,
        backend: &str,
        latency: Duration,
        prompt_tokens: usize,
        completion_tokens: usize,
    ) {
        let mut stats = self.backends.entry(backend.to_string()).or_default();
        stats.requests += 1;
        stats.successes += 1;
        stats.total_latency += latency;
        stats.last_latency = Some(latency);
        stats.prompt_tokens += prompt_tokens as u64;
        stats.completion_tokens += completion_tokens as u64;
    }

    pub fn record_failure(&self, backend: &str, latency: Duration) {
        let mut stats = self.backends.entry(backend.to_string()).or_default();
        stats.requests += 1;
        stats.failures += 1;
        stats.last_latency = Some(latency);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, backend: &str) -> Option<BackendCallStats> {
        self.backends.get(backend).map(|s| s.value().clone())
    }

    pub fn avg_latency(&self, backend: &str) -> Option<Duration> {
        self.backends.get(backend).and_then(|s| s.value().avg_latency())
    }

    /// All backend stats, sorted by name.
    pub fn backends(&self) -> Vec<(String, BackendCallStats)> {
        let mut all: Vec<(String, BackendCallStats)> = self
            .backends
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.backends.clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
    }
}
