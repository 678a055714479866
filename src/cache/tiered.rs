//! Multi-tier cache manager.
//!
//! Layers are ordered by ascending priority. Reads walk the layers and promote
//! a hit into every writable layer that precedes the one that answered. Writes,
//! deletes and clears fan out concurrently to every writable layer. Each layer
//! call is bounded by a timeout; a failing or slow layer is logged, counted and
//! skipped, never surfaced to the caller.
//!
//! The layer list is copy-on-write: readers clone an `Arc` of the current list
//! and keep using it even if a layer is added or removed mid-operation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::ManagerConfig;
use super::events::{EventKind, Notifier};
use super::keys::{CacheKey, KeyPattern};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::traits::{CacheStore, CacheValueType};
use super::types::{CacheHealth, CacheStats, SetOptions};
use crate::error::{CacheError, CacheResult};

const SOURCE: &str = "cache::tiered";
const MANAGER_NAME: &str = "tiered";

/// A store placed in the manager.
pub struct CacheLayer<V> {
    pub name: String,
    /// Lower numbers are consulted first.
    pub priority: i32,
    pub store: Arc<dyn CacheStore<V>>,
    pub enabled: bool,
    /// Never written to: no fan-out, no promotion.
    pub read_only: bool,
    /// Read only after an earlier layer failed during the same read.
    pub fallback: bool,
}

impl<V> Clone for CacheLayer<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            priority: self.priority,
            store: Arc::clone(&self.store),
            enabled: self.enabled,
            read_only: self.read_only,
            fallback: self.fallback,
        }
    }
}

impl<V> fmt::Debug for CacheLayer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("read_only", &self.read_only)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl<V> CacheLayer<V> {
    pub fn new(name: impl Into<String>, priority: i32, store: Arc<dyn CacheStore<V>>) -> Self {
        Self {
            name: name.into(),
            priority,
            store,
            enabled: true,
            read_only: false,
            fallback: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn writable(&self) -> bool {
        self.enabled && !self.read_only
    }

    fn info(&self) -> LayerInfo {
        LayerInfo {
            name: self.name.clone(),
            priority: self.priority,
            enabled: self.enabled,
            read_only: self.read_only,
            fallback: self.fallback,
        }
    }
}

/// Layer description returned by [`TieredCacheManager::get_layers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub read_only: bool,
    pub fallback: bool,
}

#[derive(Default)]
struct ManagerCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    layer_errors: AtomicU64,
}

impl ManagerCounters {
    fn reset(&self) {
        for counter in [
            &self.requests,
            &self.hits,
            &self.misses,
            &self.promotions,
            &self.layer_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Composes prioritized [`CacheStore`] layers behind the same capability.
pub struct TieredCacheManager<V> {
    config: ManagerConfig,
    layers: RwLock<Arc<Vec<CacheLayer<V>>>>,
    counters: ManagerCounters,
    last_reset: Mutex<OffsetDateTime>,
    notifier: Arc<dyn Notifier>,
}

impl<V: CacheValueType> TieredCacheManager<V> {
    pub fn new(config: ManagerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            layers: RwLock::new(Arc::new(Vec::new())),
            counters: ManagerCounters::default(),
            last_reset: Mutex::new(OffsetDateTime::now_utc()),
            notifier,
        }
    }

    // ========================================================================
    // Layer administration
    // ========================================================================

    /// Insert a layer, keeping the list ordered by priority (stable for ties).
    pub fn add_layer(&self, layer: CacheLayer<V>) -> CacheResult<()> {
        let info = layer.info();
        self.mutate_layers("add_layer", |layers| {
            if layers.iter().any(|existing| existing.name == layer.name) {
                return Err(CacheError::LayerExists(layer.name.clone()));
            }
            layers.push(layer);
            layers.sort_by_key(|layer| layer.priority);
            Ok(())
        })?;

        info!(layer = %info.name, priority = info.priority, read_only = info.read_only, fallback = info.fallback, "Cache layer added");
        self.notifier.publish(EventKind::LayerAdded {
            layer: info.name,
            priority: info.priority,
        });
        Ok(())
    }

    pub fn remove_layer(&self, name: &str) -> CacheResult<()> {
        self.mutate_layers("remove_layer", |layers| {
            let idx = layers
                .iter()
                .position(|layer| layer.name == name)
                .ok_or_else(|| CacheError::LayerNotFound(name.to_string()))?;
            layers.remove(idx);
            Ok(())
        })?;

        info!(layer = %name, "Cache layer removed");
        self.notifier.publish(EventKind::LayerRemoved {
            layer: name.to_string(),
        });
        Ok(())
    }

    /// Enable or disable a layer.
    pub fn enable_layer(&self, name: &str, enabled: bool) -> CacheResult<()> {
        self.mutate_layers("enable_layer", |layers| {
            let layer = layers
                .iter_mut()
                .find(|layer| layer.name == name)
                .ok_or_else(|| CacheError::LayerNotFound(name.to_string()))?;
            layer.enabled = enabled;
            Ok(())
        })?;

        info!(layer = %name, enabled, "Cache layer toggled");
        self.notifier.publish(EventKind::LayerToggled {
            layer: name.to_string(),
            enabled,
        });
        Ok(())
    }

    /// Layers in consultation order.
    pub fn get_layers(&self) -> Vec<LayerInfo> {
        self.snapshot().iter().map(CacheLayer::info).collect()
    }

    pub fn layer_store(&self, name: &str) -> Option<Arc<dyn CacheStore<V>>> {
        self.snapshot()
            .iter()
            .find(|layer| layer.name == name)
            .map(|layer| Arc::clone(&layer.store))
    }

    fn snapshot(&self) -> Arc<Vec<CacheLayer<V>>> {
        Arc::clone(&rw_read(&self.layers, SOURCE, "snapshot"))
    }

    fn mutate_layers(
        &self,
        op: &'static str,
        change: impl FnOnce(&mut Vec<CacheLayer<V>>) -> CacheResult<()>,
    ) -> CacheResult<()> {
        let mut guard = rw_write(&self.layers, SOURCE, op);
        let mut next = guard.as_ref().clone();
        change(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    // ========================================================================
    // Bounded layer calls
    // ========================================================================

    async fn call<T>(
        &self,
        layer: &CacheLayer<V>,
        op: &'static str,
        fut: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        let limit = self.config.layer_timeout();
        let err = match timeout(limit, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => CacheError::Timeout {
                store: layer.name.clone(),
                elapsed_ms: limit.as_millis() as u64,
            },
        };
        self.record_layer_error(&layer.name, op, &err);
        Err(err)
    }

    /// Bound an infallible probe (stats, health). `None` on timeout.
    async fn probe<T>(
        &self,
        layer: &CacheLayer<V>,
        op: &'static str,
        fut: impl Future<Output = T>,
    ) -> Option<T> {
        let limit = self.config.layer_timeout();
        match timeout(limit, fut).await {
            Ok(value) => Some(value),
            Err(_) => {
                self.record_layer_error(
                    &layer.name,
                    op,
                    &CacheError::Timeout {
                        store: layer.name.clone(),
                        elapsed_ms: limit.as_millis() as u64,
                    },
                );
                None
            }
        }
    }

    fn record_layer_error(&self, layer: &str, op: &'static str, err: &CacheError) {
        self.counters.layer_errors.fetch_add(1, Ordering::Relaxed);
        counter!("tiercache_layer_error_total", "layer" => layer.to_string()).increment(1);
        warn!(layer = %layer, op, error = %err, "Cache layer call failed; continuing without it");
        self.notifier.publish(EventKind::CacheError {
            store: layer.to_string(),
            operation: op.to_string(),
            message: err.to_string(),
        });
    }

    async fn promote(
        &self,
        layers: &[CacheLayer<V>],
        source: &CacheLayer<V>,
        key: &CacheKey,
        value: &V,
    ) {
        let targets = layers
            .iter()
            .filter(|layer| layer.writable() && layer.priority < source.priority);
        let options = SetOptions {
            ttl: self.config.promotion_ttl(),
            ..SetOptions::default()
        };

        let writes = targets.map(|target| {
            let options = options.clone();
            async move {
                let stored = self
                    .call(target, "promote", target.store.set(key, value.clone(), options))
                    .await;
                (target, stored)
            }
        });

        for (target, stored) in join_all(writes).await {
            if let Ok(true) = stored {
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                counter!("tiercache_promotion_total", "layer" => target.name.clone()).increment(1);
                debug!(key = %key, from = %source.name, to = %target.name, "Promoted cache entry");
            }
        }
    }

    /// Run `op` on every writable layer concurrently. Failed layers yield `None`.
    async fn fan_out<'a, T, F, Fut>(
        &self,
        layers: &'a [CacheLayer<V>],
        op_name: &'static str,
        op: F,
    ) -> Vec<Option<T>>
    where
        F: Fn(&'a CacheLayer<V>) -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let op = &op;
        let calls = layers
            .iter()
            .filter(|layer| layer.writable())
            .map(|layer| async move { self.call(layer, op_name, op(layer)).await.ok() });
        join_all(calls).await
    }
}

#[async_trait]
impl<V: CacheValueType> CacheStore<V> for TieredCacheManager<V> {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let layers = self.snapshot();
        let mut upstream_failed = false;

        for layer in layers.iter().filter(|layer| layer.enabled) {
            if layer.fallback && !upstream_failed {
                continue;
            }
            match self.call(layer, "get", layer.store.get(key)).await {
                Ok(Some(value)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, layer = %layer.name, "tiered hit");
                    self.promote(&layers, layer, key, &value).await;
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(_) => upstream_failed = true,
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "tiered miss");
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: V, options: SetOptions) -> CacheResult<bool> {
        let layers = self.snapshot();
        let results = self
            .fan_out(&layers, "set", |layer| {
                layer.store.set(key, value.clone(), options.clone())
            })
            .await;
        Ok(results.into_iter().any(|stored| stored == Some(true)))
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        let layers = self.snapshot();
        let results = self
            .fan_out(&layers, "delete", |layer| layer.store.delete(key))
            .await;
        Ok(results.into_iter().any(|deleted| deleted == Some(true)))
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        let layers = self.snapshot();
        let checks = layers
            .iter()
            .filter(|layer| layer.enabled)
            .map(|layer| self.call(layer, "exists", layer.store.exists(key)));
        Ok(join_all(checks)
            .await
            .into_iter()
            .any(|present| matches!(present, Ok(true))))
    }

    async fn clear(&self, namespace: Option<&str>) -> CacheResult<bool> {
        let layers = self.snapshot();
        let results = self
            .fan_out(&layers, "clear", |layer| layer.store.clear(namespace))
            .await;
        Ok(results.into_iter().any(|cleared| cleared == Some(true)))
    }

    async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let layers = self.snapshot();
        let results = self
            .fan_out(&layers, "invalidate_tags", |layer| {
                layer.store.invalidate_tags(tags)
            })
            .await;
        Ok(results.into_iter().flatten().sum())
    }

    async fn list_keys(&self, pattern: &KeyPattern) -> CacheResult<Option<Vec<CacheKey>>> {
        let layers = self.snapshot();
        let listings = layers
            .iter()
            .filter(|layer| layer.enabled)
            .map(|layer| self.call(layer, "list_keys", layer.store.list_keys(pattern)));

        let mut enumerable = false;
        let mut union = BTreeMap::new();
        for keys in join_all(listings).await.into_iter().flatten().flatten() {
            enumerable = true;
            for key in keys {
                union.entry(key.to_canonical()).or_insert(key);
            }
        }
        Ok(enumerable.then(|| union.into_values().collect()))
    }

    async fn stats(&self) -> CacheStats {
        let layers = self.snapshot();
        let probes = layers
            .iter()
            .map(|layer| async move { (layer, self.probe(layer, "stats", layer.store.stats()).await) });
        let layer_stats = join_all(probes).await;

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let mut stats = CacheStats::empty(*mutex_lock(&self.last_reset, SOURCE, "stats"));
        stats.hits = hits;
        stats.misses = misses;
        stats.hit_rate = CacheStats::compute_hit_rate(hits, misses);

        for (layer, layer_stats) in layer_stats {
            let Some(layer_stats) = layer_stats else {
                continue;
            };
            if layer.enabled {
                stats.entry_count += layer_stats.entry_count;
                stats.total_size += layer_stats.total_size;
                stats.evicted_entries += layer_stats.evicted_entries;
                stats.expired_entries += layer_stats.expired_entries;
            }
            stats.layers.insert(layer.name.clone(), layer_stats);
        }
        stats.average_size = CacheStats::compute_average_size(stats.total_size, stats.entry_count);

        for (name, counter) in [
            ("requests", &self.counters.requests),
            ("promotions", &self.counters.promotions),
            ("layer_errors", &self.counters.layer_errors),
        ] {
            stats
                .counters
                .insert(name.to_string(), counter.load(Ordering::Relaxed));
        }
        stats
    }

    async fn health(&self) -> CacheHealth {
        let layers = self.snapshot();
        let probes = layers.iter().filter(|layer| layer.enabled).map(|layer| async move {
            let health = self
                .probe(layer, "health", layer.store.health())
                .await
                .unwrap_or_else(|| CacheHealth::unhealthy("health check timed out"));
            (layer.name.clone(), health)
        });
        let layer_health: BTreeMap<String, CacheHealth> = join_all(probes).await.into_iter().collect();

        if layer_health.is_empty() {
            return CacheHealth::unhealthy("no enabled cache layers");
        }

        let unhealthy: Vec<&str> = layer_health
            .iter()
            .filter(|(_, health)| !health.healthy)
            .map(|(name, _)| name.as_str())
            .collect();
        let response_time_ms = layer_health
            .values()
            .map(|health| health.response_time_ms)
            .sum::<f64>()
            / layer_health.len() as f64;

        CacheHealth {
            healthy: unhealthy.is_empty(),
            connected: layer_health.values().any(|health| health.connected),
            response_time_ms,
            error: (!unhealthy.is_empty())
                .then(|| format!("unhealthy layers: {}", unhealthy.join(", "))),
            last_check_time: OffsetDateTime::now_utc(),
            layers: layer_health,
        }
    }

    async fn reset_stats(&self) {
        self.counters.reset();
        *mutex_lock(&self.last_reset, SOURCE, "reset_stats") = OffsetDateTime::now_utc();
        let layers = self.snapshot();
        join_all(
            layers
                .iter()
                .map(|layer| self.probe(layer, "reset_stats", layer.store.reset_stats())),
        )
        .await;
    }
}
