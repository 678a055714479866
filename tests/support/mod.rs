//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tiercache::cache::{
    CacheHealth, CacheKey, CacheStats, CacheStore, KeyOptions, KeyPattern, MemoryStore,
    NoopNotifier, SetOptions, StoreConfig,
};
use tiercache::error::{CacheError, CacheResult};

/// Memory-backed tier whose calls can be scripted to fail or stall.
pub struct ScriptedStore {
    inner: MemoryStore<String>,
    failing: AtomicBool,
    stall_ms: AtomicU64,
}

impl ScriptedStore {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(StoreConfig::named(name), Arc::new(NoopNotifier)),
            failing: AtomicBool::new(false),
            stall_ms: AtomicU64::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stall(&self, stall: Duration) {
        self.stall_ms.store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore<String> {
        &self.inner
    }

    async fn gate(&self) -> CacheResult<()> {
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::store(self.inner.name(), "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore<String> for ScriptedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<String>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &CacheKey, value: String, options: SetOptions) -> CacheResult<bool> {
        self.gate().await?;
        self.inner.set(key, value, options).await
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn clear(&self, namespace: Option<&str>) -> CacheResult<bool> {
        self.gate().await?;
        self.inner.clear(namespace).await
    }

    async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        self.gate().await?;
        self.inner.invalidate_tags(tags).await
    }

    async fn list_keys(&self, pattern: &KeyPattern) -> CacheResult<Option<Vec<CacheKey>>> {
        self.gate().await?;
        self.inner.list_keys(pattern).await
    }

    async fn stats(&self) -> CacheStats {
        self.inner.stats().await
    }

    async fn health(&self) -> CacheHealth {
        if self.failing.load(Ordering::SeqCst) {
            CacheHealth::unhealthy("scripted failure")
        } else {
            self.inner.health().await
        }
    }

    async fn reset_stats(&self) {
        self.inner.reset_stats().await
    }
}

pub fn memory(name: &str) -> Arc<MemoryStore<String>> {
    Arc::new(MemoryStore::new(
        StoreConfig::named(name),
        Arc::new(NoopNotifier),
    ))
}

pub fn key(namespace: &str, name: &str) -> CacheKey {
    CacheKey::new(name, &KeyOptions::new().namespace(namespace)).expect("valid key")
}
