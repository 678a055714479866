//! Assembly of the full cache stack from configuration.

use std::sync::Arc;

use futures::future::join_all;
use tracing::info;

use super::config::CacheConfig;
use super::events::EventQueue;
use super::invalidation::InvalidationEngine;
use super::keys::KeyFactory;
use super::memory::MemoryStore;
use super::task::BackgroundTask;
use super::tiered::{CacheLayer, TieredCacheManager};
use super::traits::{CacheStore, CacheValueType};
use crate::error::CacheResult;

/// Key factory, tiered manager and invalidation engine wired together.
///
/// Every component publishes into one shared [`EventQueue`]. Background tasks
/// (store sweepers, rule scheduler, stats monitor) run until [`shutdown`].
///
/// [`shutdown`]: CacheSystem::shutdown
pub struct CacheSystem<V> {
    keys: KeyFactory,
    manager: Arc<TieredCacheManager<V>>,
    engine: Arc<InvalidationEngine<V>>,
    events: Arc<EventQueue>,
    tasks: Vec<BackgroundTask>,
}

impl<V: CacheValueType> CacheSystem<V> {
    /// Build every configured layer as an in-memory store and start the
    /// background tasks. Must be called inside a Tokio runtime.
    pub fn build(config: &CacheConfig) -> CacheResult<Self> {
        let keys = KeyFactory::new(config.default_namespace.clone(), config.default_version.clone())?;
        let events = Arc::new(EventQueue::new(config.invalidation.event_queue_limit_non_zero()));
        let manager = Arc::new(TieredCacheManager::<V>::new(
            config.manager.clone(),
            events.clone(),
        ));
        let mut tasks = Vec::new();

        for layer in &config.layers {
            let store = Arc::new(MemoryStore::<V>::new(layer.store.clone(), events.clone()));
            tasks.extend(store.start_sweeper());

            let mut cache_layer = CacheLayer::new(layer.store.name.clone(), layer.priority, store);
            if layer.read_only {
                cache_layer = cache_layer.read_only();
            }
            if layer.fallback {
                cache_layer = cache_layer.fallback();
            }
            if !layer.enabled {
                cache_layer = cache_layer.disabled();
            }
            manager.add_layer(cache_layer)?;
        }

        let engine = Arc::new(InvalidationEngine::<V>::new(
            config.invalidation.clone(),
            events.clone(),
        ));
        engine.bind_store(manager.clone());
        tasks.push(engine.start_scheduler());
        tasks.extend(engine.start_monitor());

        info!(
            layers = config.layers.len(),
            background_tasks = tasks.len(),
            "Cache system ready"
        );

        Ok(Self {
            keys,
            manager,
            engine,
            events,
            tasks,
        })
    }

    pub fn keys(&self) -> &KeyFactory {
        &self.keys
    }

    pub fn manager(&self) -> &Arc<TieredCacheManager<V>> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<InvalidationEngine<V>> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// The tiered manager as a plain store.
    pub fn store(&self) -> Arc<dyn CacheStore<V>> {
        self.manager.clone()
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let count = self.tasks.len();
        join_all(self.tasks.into_iter().map(BackgroundTask::stop)).await;
        info!(stopped = count, "Cache system shut down");
    }
}
