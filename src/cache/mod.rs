//! Tiered cache engine.
//!
//! - **Keys**: [`KeyFactory`] builds structured [`CacheKey`]s with one canonical
//!   string form shared by every store
//! - **Stores**: [`MemoryStore`] is a bounded single tier with LRU/LFU/FIFO/TTL
//!   eviction; anything implementing [`CacheStore`] can act as a tier
//! - **Tiers**: [`TieredCacheManager`] reads through prioritized layers,
//!   promotes hits upward and writes through to every writable layer
//! - **Invalidation**: [`InvalidationEngine`] turns strategies and rules into
//!   store operations
//!
//! [`CacheSystem`] wires all of it from a [`CacheConfig`].

mod config;
mod events;
mod eviction;
pub mod invalidation;
mod keys;
mod lock;
mod memory;
mod planner;
mod system;
mod task;
mod tiered;
mod traits;
mod types;

pub use config::{CacheConfig, InvalidationConfig, LayerConfig, ManagerConfig, StoreConfig};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue, NoopNotifier, Notifier};
pub use eviction::EvictionStrategy;
pub use invalidation::{
    InvalidationEngine, InvalidationOptions, InvalidationResult, InvalidationRule,
    InvalidationStats, InvalidationStrategy, RuleCondition, RuleContext, RuleTrigger, RuleUpdate,
    Targets,
};
pub use keys::{
    CacheKey, KeyFactory, KeyOptions, KeyPattern, glob_match, normalize_version, sanitize_key,
    sanitize_namespace, sanitize_tags,
};
pub use memory::MemoryStore;
pub use planner::{InvalidationPlan, PlanStep};
pub use system::CacheSystem;
pub use task::BackgroundTask;
pub use tiered::{CacheLayer, LayerInfo, TieredCacheManager};
pub use traits::{CacheStore, CacheStoreExt, CacheValueType};
pub use types::{CacheHealth, CacheStats, CacheValue, SetOptions};
