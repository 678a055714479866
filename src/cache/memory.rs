//! Single-tier in-memory store.
//!
//! All entries, the access-order sequence (LRU), the frequency table (LFU) and
//! the counters live behind one mutex, so no operation observes a partially
//! applied update. Expiry deadlines use `tokio::time::Instant`, which lets
//! paused-time tests drive TTLs deterministically.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::config::StoreConfig;
use super::events::{EventKind, Notifier};
use super::eviction::EvictionStrategy;
use super::keys::{CacheKey, KeyPattern, sanitize_tags};
use super::lock::mutex_lock;
use super::task::BackgroundTask;
use super::traits::{CacheStore, CacheValueType};
use super::types::{CacheHealth, CacheStats, CacheValue, SetOptions};
use crate::error::{CacheError, CacheResult};

const SOURCE: &str = "cache::memory";

struct CacheEntry<V> {
    key: CacheKey,
    value: CacheValue<V>,
    size_bytes: usize,
    deadline: Option<Instant>,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    fn carries_any_tag(&self, tags: &[String]) -> bool {
        self.key.has_any_tag(tags) || self.value.tags.iter().any(|tag| tags.contains(tag))
    }
}

struct Counters {
    hits: u64,
    misses: u64,
    evicted: u64,
    expired: u64,
    last_reset: OffsetDateTime,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evicted: 0,
            expired: 0,
            last_reset: OffsetDateTime::now_utc(),
        }
    }
}

struct StoreState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: LruCache<String, ()>,
    frequency: HashMap<String, u64>,
    next_seq: u64,
    total_size: usize,
    counters: Counters,
}

impl<V> StoreState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: LruCache::unbounded(),
            frequency: HashMap::new(),
            next_seq: 0,
            total_size: 0,
            counters: Counters::new(),
        }
    }

    fn remove(&mut self, canonical: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(canonical)?;
        self.recency.pop(canonical);
        self.frequency.remove(canonical);
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&CacheEntry<V>) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(canonical, _)| canonical.clone())
            .collect();
        for canonical in &doomed {
            self.remove(canonical);
        }
        doomed
    }

    fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.recency.clear();
        self.frequency.clear();
        self.total_size = 0;
        removed
    }

    /// Pick the entry to evict under `strategy`.
    fn select_victim(&self, strategy: EvictionStrategy) -> Option<String> {
        match strategy {
            EvictionStrategy::Lru => self.recency.peek_lru().map(|(key, _)| key.clone()),
            // First minimum in HashMap iteration order; ties are unordered.
            EvictionStrategy::Lfu => self
                .frequency
                .iter()
                .min_by_key(|(_, count)| **count)
                .map(|(key, _)| key.clone()),
            EvictionStrategy::Fifo => self.oldest_entry(),
            EvictionStrategy::Ttl => self
                .entries
                .iter()
                .filter_map(|(key, entry)| entry.deadline.map(|deadline| (deadline, entry.seq, key)))
                .min()
                .map(|(_, _, key)| key.clone())
                .or_else(|| self.oldest_entry()),
        }
    }

    fn oldest_entry(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| (entry.value.created_at, entry.seq))
            .map(|(key, _)| key.clone())
    }
}

/// Bounded in-memory [`CacheStore`].
///
/// When a write for a new key finds the store full, exactly one entry is
/// evicted first, chosen by the configured strategy. The per-call strategy in
/// [`SetOptions`] is only recorded in the entry's metadata.
pub struct MemoryStore<V> {
    config: StoreConfig,
    state: Mutex<StoreState<V>>,
    notifier: Arc<dyn Notifier>,
}

impl<V: CacheValueType> MemoryStore<V> {
    pub fn new(config: StoreConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState::new()),
            notifier,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Live entry count, expired entries included until swept.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an entry without touching stats, recency or frequency.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheValue<V>> {
        let state = mutex_lock(&self.state, SOURCE, "peek");
        state
            .entries
            .get(&key.to_canonical())
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut state = mutex_lock(&self.state, SOURCE, "sweep");
            let removed = state.remove_where(|entry| entry.is_expired(now));
            state.counters.expired += removed.len() as u64;
            removed
        };

        let count = removed.len();
        if count > 0 {
            counter!("tiercache_store_expire_total", "store" => self.config.name.clone())
                .increment(count as u64);
            debug!(store = %self.config.name, expired = count, "Swept expired entries");
            for key in removed {
                self.notifier.publish(EventKind::CacheEvict {
                    store: self.config.name.clone(),
                    key,
                    reason: "expired".to_string(),
                });
            }
        }
        count
    }

    /// Spawn the periodic expiry sweep, if configured.
    ///
    /// The task holds a weak reference and ends on its own once the store is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> Option<BackgroundTask> {
        let period = self.config.sweep_interval()?;
        let store = Arc::downgrade(self);
        Some(BackgroundTask::spawn(
            format!("sweeper:{}", self.config.name),
            period,
            move || {
                let store = store.clone();
                async move {
                    match store.upgrade() {
                        Some(store) => {
                            store.sweep();
                            ControlFlow::Continue(())
                        }
                        None => ControlFlow::Break(()),
                    }
                }
            },
        ))
    }

    fn record_expired(&self, key: &str) {
        counter!("tiercache_store_expire_total", "store" => self.config.name.clone()).increment(1);
        self.notifier.publish(EventKind::CacheEvict {
            store: self.config.name.clone(),
            key: key.to_string(),
            reason: "expired".to_string(),
        });
    }

    fn effective_ttl(&self, options: &SetOptions) -> Option<std::time::Duration> {
        options
            .ttl
            .or_else(|| self.config.default_ttl())
            .filter(|ttl| !ttl.is_zero())
    }
}

#[async_trait]
impl<V: CacheValueType> CacheStore<V> for MemoryStore<V> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let canonical = key.to_canonical();
        let now = Instant::now();

        let (value, expired) = {
            let mut state = mutex_lock(&self.state, SOURCE, "get");
            let expired = state
                .entries
                .get(&canonical)
                .is_some_and(|entry| entry.is_expired(now));
            if expired {
                state.remove(&canonical);
                state.counters.expired += 1;
            }

            let value = match state.entries.get_mut(&canonical) {
                Some(entry) => {
                    entry.value.access_count += 1;
                    entry.value.last_accessed = OffsetDateTime::now_utc();
                    Some(entry.value.value.clone())
                }
                None => None,
            };
            if value.is_some() {
                state.recency.promote(&canonical);
                *state.frequency.entry(canonical.clone()).or_insert(0) += 1;
                state.counters.hits += 1;
            } else {
                state.counters.misses += 1;
            }
            (value, expired)
        };

        if expired {
            self.record_expired(&canonical);
        }

        let store = self.config.name.clone();
        if value.is_some() {
            trace!(store = %store, key = %canonical, "cache hit");
            counter!("tiercache_store_hit_total", "store" => store.clone()).increment(1);
            self.notifier.publish(EventKind::CacheHit {
                store,
                key: canonical,
            });
        } else {
            trace!(store = %store, key = %canonical, "cache miss");
            counter!("tiercache_store_miss_total", "store" => store.clone()).increment(1);
            self.notifier.publish(EventKind::CacheMiss {
                store,
                key: canonical,
            });
        }
        Ok(value)
    }

    async fn set(&self, key: &CacheKey, value: V, options: SetOptions) -> CacheResult<bool> {
        let canonical = key.to_canonical();
        let size_bytes = serde_json::to_vec(&value)
            .map_err(|err| {
                CacheError::store(&self.config.name, format!("value not serializable: {err}"))
            })?
            .len();

        let ttl = self.effective_ttl(&options);
        let created_at = OffsetDateTime::now_utc();
        let mut metadata: BTreeMap<String, String> = options.metadata;
        if let Some(strategy) = options.strategy {
            metadata.insert("strategy".to_string(), strategy.to_string());
        }
        let cache_value = CacheValue {
            value,
            created_at,
            expires_at: ttl.and_then(|ttl| created_at.checked_add(ttl.try_into().ok()?)),
            access_count: 0,
            last_accessed: created_at,
            version: key.version().map(str::to_string),
            tags: sanitize_tags(&options.tags),
            metadata,
        };

        let victim = {
            let mut state = mutex_lock(&self.state, SOURCE, "set");
            let mut victim = None;
            if !state.entries.contains_key(&canonical)
                && state.entries.len() >= self.config.max_size_non_zero().get()
            {
                if let Some(selected) = state.select_victim(self.config.strategy) {
                    state.remove(&selected);
                    state.counters.evicted += 1;
                    victim = Some(selected);
                }
            }

            if let Some(previous) = state.entries.remove(&canonical) {
                state.total_size = state.total_size.saturating_sub(previous.size_bytes);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.total_size += size_bytes;
            state.entries.insert(
                canonical.clone(),
                CacheEntry {
                    key: key.clone(),
                    value: cache_value,
                    size_bytes,
                    deadline: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
                    seq,
                },
            );
            state.recency.put(canonical.clone(), ());
            state.frequency.entry(canonical.clone()).or_insert(0);
            victim
        };

        if let Some(victim) = victim {
            debug!(
                store = %self.config.name,
                victim = %victim,
                strategy = %self.config.strategy,
                "Evicted entry to make room"
            );
            counter!("tiercache_store_evict_total", "store" => self.config.name.clone())
                .increment(1);
            self.notifier.publish(EventKind::CacheEvict {
                store: self.config.name.clone(),
                key: victim,
                reason: self.config.strategy.to_string(),
            });
        }

        self.notifier.publish(EventKind::CacheSet {
            store: self.config.name.clone(),
            key: canonical,
        });
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let canonical = key.to_canonical();
        let removed = mutex_lock(&self.state, SOURCE, "delete")
            .remove(&canonical)
            .is_some();
        if removed {
            self.notifier.publish(EventKind::CacheDelete {
                store: self.config.name.clone(),
                key: canonical,
            });
        }
        Ok(removed)
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        let canonical = key.to_canonical();
        let now = Instant::now();
        let (present, expired) = {
            let mut state = mutex_lock(&self.state, SOURCE, "exists");
            match state.entries.get(&canonical).map(|entry| entry.is_expired(now)) {
                Some(true) => {
                    state.remove(&canonical);
                    state.counters.expired += 1;
                    (false, true)
                }
                Some(false) => (true, false),
                None => (false, false),
            }
        };
        if expired {
            self.record_expired(&canonical);
        }
        Ok(present)
    }

    async fn clear(&self, namespace: Option<&str>) -> CacheResult<bool> {
        let removed = {
            let mut state = mutex_lock(&self.state, SOURCE, "clear");
            match namespace {
                None => state.clear(),
                Some(ns) => state
                    .remove_where(|entry| entry.key.namespace() == Some(ns))
                    .len(),
            }
        };
        debug!(store = %self.config.name, namespace = ?namespace, removed, "Cleared entries");
        self.notifier.publish(EventKind::CacheClear {
            store: self.config.name.clone(),
            namespace: namespace.map(str::to_string),
            removed,
        });
        Ok(true)
    }

    async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let tags = sanitize_tags(tags);
        if tags.is_empty() {
            return Ok(0);
        }
        let removed = mutex_lock(&self.state, SOURCE, "invalidate_tags")
            .remove_where(|entry| entry.carries_any_tag(&tags));
        for key in &removed {
            self.notifier.publish(EventKind::CacheDelete {
                store: self.config.name.clone(),
                key: key.clone(),
            });
        }
        Ok(removed.len())
    }

    async fn list_keys(&self, pattern: &KeyPattern) -> CacheResult<Option<Vec<CacheKey>>> {
        let now = Instant::now();
        let state = mutex_lock(&self.state, SOURCE, "list_keys");
        let mut keys: Vec<CacheKey> = state
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now) && pattern.matches(&entry.key))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort_by_cached_key(CacheKey::to_canonical);
        Ok(Some(keys))
    }

    async fn stats(&self) -> CacheStats {
        let state = mutex_lock(&self.state, SOURCE, "stats");
        let counters = &state.counters;
        let entry_count = state.entries.len();
        let mut stats = CacheStats::empty(counters.last_reset);
        stats.hits = counters.hits;
        stats.misses = counters.misses;
        stats.hit_rate = CacheStats::compute_hit_rate(counters.hits, counters.misses);
        stats.entry_count = entry_count;
        stats.total_size = state.total_size;
        stats.average_size = CacheStats::compute_average_size(state.total_size, entry_count);
        stats.evicted_entries = counters.evicted;
        stats.expired_entries = counters.expired;
        stats
    }

    async fn health(&self) -> CacheHealth {
        let started = std::time::Instant::now();
        if self.state.is_poisoned() {
            return CacheHealth::unhealthy("entry table lock poisoned");
        }
        CacheHealth::healthy(started.elapsed().as_secs_f64() * 1000.0)
    }

    async fn reset_stats(&self) {
        mutex_lock(&self.state, SOURCE, "reset_stats").counters = Counters::new();
    }
}
