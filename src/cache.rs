//! Response caching: the [`Cache`] contract and an in-process LRU + TTL store.
//!
//! The orchestrator only talks to `Arc<dyn Cache<LLMResponse>>`, so a shared
//! remote cache can replace [`LruCache`] without touching request flow.
//!
//! ## LRU layout
//!
//! ```text
//!  index: HashMap<key, slot>
//!             │
//!             ▼
//!  nodes: [ Some(n0) | None | Some(n2) | Some(n3) ]     free: [1]
//!
//!  head (MRU) ─► n2 ◄─► n0 ◄─► n3 ◄─ tail (LRU)
//! ```
//!
//! Nodes live in a `Vec` arena and link to each other by slot index. Freed
//! slots are recycled through the free list, so `get`, `set` and `delete`
//! are O(1) amortized.
//!
//! ## Expiry
//!
//! Entries expire lazily: a `get` on an expired entry is a miss and removes
//! it. [`LruCache::spawn_sweeper`] purges expired entries in the background
//! for callers that want memory returned sooner.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{HubError, Result};

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Whether the orchestrator consults the cache at all.
    pub enabled: bool,
    /// Maximum number of entries.
    pub max_size: usize,
    /// TTL applied when `set` is called without one.
    pub default_ttl: Duration,
    /// Background sweep period. `None` relies on lazy expiry only.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            default_ttl: Duration::from_secs(3600), // 1 hour
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with the given capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run a background sweep every `interval`.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(HubError::Config("cache max_size must be at least 1".to_string()));
        }
        if self.default_ttl.is_zero() {
            return Err(HubError::Config("cache default_ttl must be positive".to_string()));
        }
        if self.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(HubError::Config("cache sweep_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired lookups included.
    pub misses: u64,
    /// Current number of entries.
    pub size: usize,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
}

impl<V> CacheEntry<V> {
    /// Logically absent once `now >= expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Key/value store the orchestrator caches responses in.
#[async_trait]
pub trait Cache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Store a value. `ttl = None` uses the store's default.
    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()>;

    /// Check for a live value without counting a hit or miss.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Remove a value, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;

    /// Current statistics.
    async fn stats(&self) -> Result<CacheStats>;

    /// Batch `get`, preserving input order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<V>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Batch `set` with one TTL for every entry.
    async fn mset(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Batch `delete`, returning how many keys existed.
    async fn mdel(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct Node<V> {
    key: String,
    entry: CacheEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct LruInner<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> LruInner<V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.detach(slot);
            self.push_front(slot);
        }
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Option<Node<V>> {
        self.detach(slot);
        let node = self.nodes.get_mut(slot).and_then(Option::take)?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some(node)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let tail = self.tail?;
        let node = self.remove_slot(tail)?;
        self.evictions += 1;
        Some(node.key)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }
}

/// In-process LRU cache with per-entry TTL.
pub struct LruCache<V> {
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<LruInner<V>>,
}

impl<V> LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache from `config`. A zero capacity is treated as 1.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            default_ttl: config.default_ttl,
            inner: Mutex::new(LruInner::new()),
        }
    }

    /// Create a cache with the given capacity and TTL.
    pub fn with_capacity(max_size: usize, default_ttl: Duration) -> Self {
        Self::new(&CacheConfig::new(max_size).with_ttl(default_ttl))
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Number of physically present entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of an entry without promoting it or touching stats.
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(key)?;
        inner.node(slot).map(|n| n.entry.clone())
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(inner.len());
        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            match inner.node(slot) {
                Some(n) => {
                    keys.push(n.key.clone());
                    cursor = n.next;
                }
                None => break,
            }
        }
        keys
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<usize> = inner
            .index
            .values()
            .copied()
            .filter(|&slot| inner.node(slot).is_some_and(|n| n.entry.is_expired(now)))
            .collect();
        for &slot in &expired {
            inner.remove_slot(slot);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Spawn a task that calls [`purge_expired`](Self::purge_expired) every
    /// `interval`. The task stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Cache sweep removed expired entries");
                }
            }
        })
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(&slot) = inner.index.get(key) else {
            inner.misses += 1;
            return None;
        };

        let expired = inner.node(slot).is_some_and(|n| n.entry.is_expired(now));
        if expired {
            inner.remove_slot(slot);
            inner.expirations += 1;
            inner.misses += 1;
            trace!(key, "Cache entry expired");
            return None;
        }

        inner.promote(slot);
        inner.hits += 1;
        let node = inner.node_mut(slot)?;
        node.entry.hit_count += 1;
        Some(node.entry.value.clone())
    }

    fn insert(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        };

        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(key) {
            if let Some(node) = inner.node_mut(slot) {
                node.entry = entry;
            }
            inner.promote(slot);
            return;
        }

        while inner.len() >= self.max_size {
            match inner.evict_lru() {
                Some(evicted) => trace!(key = %evicted, "Evicted least recently used entry"),
                None => break,
            }
        }

        let slot = inner.alloc(Node {
            key: key.to_string(),
            entry,
            prev: None,
            next: None,
        });
        inner.index.insert(key.to_string(), slot);
        inner.push_front(slot);
    }
}

#[async_trait]
impl<V> Cache<V> for LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(HubError::Validation("cache ttl must be positive".to_string()));
        }
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(key)
            .and_then(|&slot| inner.node(slot))
            .is_some_and(|n| !n.entry.is_expired(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.index.get(key).copied() {
            Some(slot) => Ok(inner.remove_slot(slot).is_some()),
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().clear();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let inner = self.inner.lock();
        Ok(CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.len(),
            evictions: inner.evictions,
            expirations: inner.expirations,
        })
    }
}
