//! Cache engine configuration.
//!
//! Plain runtime configuration consumed by the store, manager and engine
//! constructors. Loaded settings convert into it; tests build it directly.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::eviction::EvictionStrategy;

const DEFAULT_LAYER_NAME: &str = "memory";
const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_LAYER_TIMEOUT_MS: u64 = 250;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_SCHEDULER_TICK_MS: u64 = 1000;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;

/// One in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub name: String,
    /// Maximum entry count.
    pub max_size: usize,
    /// Victim selection when full.
    pub strategy: EvictionStrategy,
    /// TTL applied when a write does not carry one (0 = never expire).
    pub default_ttl_ms: u64,
    /// Background expiry sweep period (0 = no sweeper).
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LAYER_NAME.to_string(),
            max_size: DEFAULT_MAX_SIZE,
            strategy: EvictionStrategy::default(),
            default_ttl_ms: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the max size as NonZeroUsize, clamping to 1 if zero.
    pub fn max_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

/// A memory store placed in the tiered manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerConfig {
    pub store: StoreConfig,
    /// Lower numbers are consulted first.
    pub priority: i32,
    pub enabled: bool,
    pub read_only: bool,
    pub fallback: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            priority: 1,
            enabled: true,
            read_only: false,
            fallback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upper bound on any single layer call.
    pub layer_timeout_ms: u64,
    /// TTL for values copied upward on a hit. `None` uses the target layer's default.
    pub promotion_ttl_ms: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            layer_timeout_ms: DEFAULT_LAYER_TIMEOUT_MS,
            promotion_ttl_ms: None,
        }
    }
}

impl ManagerConfig {
    /// Layer timeout, never shorter than one millisecond.
    pub fn layer_timeout(&self) -> Duration {
        Duration::from_millis(self.layer_timeout_ms.max(1))
    }

    pub fn promotion_ttl(&self) -> Option<Duration> {
        self.promotion_ttl_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationConfig {
    /// Chunk size for the batch strategy when the caller gives none.
    pub batch_size: usize,
    /// Stats monitor period (0 = off).
    pub monitor_interval_ms: u64,
    /// How often the scheduler checks for due rules.
    pub scheduler_tick_ms: u64,
    /// Capacity of the in-memory event queue.
    pub event_queue_limit: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            monitor_interval_ms: 0,
            scheduler_tick_ms: DEFAULT_SCHEDULER_TICK_MS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
        }
    }
}

impl InvalidationConfig {
    /// Returns the batch size as NonZeroUsize, clamping to 1 if zero.
    pub fn batch_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.batch_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the event queue limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_interval_ms > 0).then(|| Duration::from_millis(self.monitor_interval_ms))
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }
}

/// Everything needed to assemble a [`CacheSystem`](super::system::CacheSystem).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_namespace: Option<String>,
    pub default_version: Option<String>,
    pub layers: Vec<LayerConfig>,
    pub manager: ManagerConfig,
    pub invalidation: InvalidationConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_namespace: None,
            default_version: None,
            layers: vec![LayerConfig::default()],
            manager: ManagerConfig::default(),
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            default_namespace: settings.keys.default_namespace.clone(),
            default_version: settings.keys.default_version.clone(),
            layers: settings
                .layers
                .iter()
                .map(|layer| LayerConfig {
                    store: StoreConfig {
                        name: layer.name.clone(),
                        max_size: layer.max_size.get(),
                        strategy: layer.strategy,
                        default_ttl_ms: duration_ms(layer.default_ttl),
                        sweep_interval_ms: duration_ms(layer.sweep_interval),
                    },
                    priority: layer.priority,
                    enabled: layer.enabled,
                    read_only: layer.read_only,
                    fallback: layer.fallback,
                })
                .collect(),
            manager: ManagerConfig {
                layer_timeout_ms: settings.manager.layer_timeout.as_millis() as u64,
                promotion_ttl_ms: settings
                    .manager
                    .promotion_ttl
                    .map(|ttl| ttl.as_millis() as u64),
            },
            invalidation: InvalidationConfig {
                batch_size: settings.invalidation.batch_size.get(),
                monitor_interval_ms: duration_ms(settings.invalidation.monitor_interval),
                scheduler_tick_ms: settings.invalidation.scheduler_tick.as_millis() as u64,
                event_queue_limit: settings.invalidation.event_queue_limit.get(),
            },
        }
    }
}

fn duration_ms(duration: Option<Duration>) -> u64 {
    duration.map(|d| d.as_millis() as u64).unwrap_or(0)
}
