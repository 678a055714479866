//! The capability every cache tier implements.
//!
//! [`MemoryStore`](super::memory::MemoryStore) and
//! [`TieredCacheManager`](super::tiered::TieredCacheManager) implement it, and so
//! can any external tier (a networked store, a test double). The manager and
//! the invalidation engine only ever see `Arc<dyn CacheStore<V>>`.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::keys::{CacheKey, KeyPattern};
use super::types::{CacheHealth, CacheStats, SetOptions};
use crate::error::CacheResult;

/// Marker for values that can be cached.
///
/// Values must be serializable so stores can size them and so external tiers
/// can ship them over the wire.
pub trait CacheValueType: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValueType for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A single cache tier.
///
/// Errors returned from `get`/`set`/`delete`/`exists`/`clear` are operational
/// (`StoreOperation`, `Timeout`); callers composing several tiers absorb them.
#[async_trait]
pub trait CacheStore<V: CacheValueType>: Send + Sync {
    /// Stable name used in logs, metrics and aggregated stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<V>>;

    async fn set(&self, key: &CacheKey, value: V, options: SetOptions) -> CacheResult<bool>;

    /// Returns `false` when the key was not present.
    async fn delete(&self, key: &CacheKey) -> CacheResult<bool>;

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Clear one namespace, or everything when `namespace` is `None`.
    async fn clear(&self, namespace: Option<&str>) -> CacheResult<bool>;

    /// Remove every entry carrying any of `tags`. Returns how many were removed.
    ///
    /// Stores that do not track tags keep the default and report zero.
    async fn invalidate_tags(&self, _tags: &[String]) -> CacheResult<usize> {
        Ok(0)
    }

    /// Enumerate live keys matching `pattern`.
    ///
    /// `Ok(None)` means this store cannot enumerate its keys.
    async fn list_keys(&self, _pattern: &KeyPattern) -> CacheResult<Option<Vec<CacheKey>>> {
        Ok(None)
    }

    async fn stats(&self) -> CacheStats;

    async fn health(&self) -> CacheHealth;

    async fn reset_stats(&self);
}

/// Cache-aside helpers available on every store.
pub trait CacheStoreExt<V: CacheValueType>: CacheStore<V> {
    /// Return the cached value, or run `loader`, store its output and return it.
    ///
    /// Store failures on either side are logged and treated as a miss / a
    /// skipped write. Only the loader's error reaches the caller.
    fn get_or_set<F, Fut, E>(
        &self,
        key: &CacheKey,
        options: SetOptions,
        loader: F,
    ) -> impl Future<Output = Result<V, E>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send,
        E: Send,
    {
        async move {
            match self.get(key).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(err) => {
                    warn!(store = self.name(), key = %key, error = %err, "cache read failed; loading");
                }
            }

            let value = loader().await?;
            if let Err(err) = self.set(key, value.clone(), options).await {
                warn!(store = self.name(), key = %key, error = %err, "cache write after load failed");
            }
            Ok(value)
        }
    }
}

impl<V, S> CacheStoreExt<V> for S
where
    V: CacheValueType,
    S: CacheStore<V> + ?Sized,
{
}
