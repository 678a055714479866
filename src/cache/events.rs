//! Cache event system.
//!
//! Components report what they did through a [`Notifier`]. The transport is the
//! caller's business: [`EventQueue`] buffers events in memory for a consumer to
//! drain, [`NoopNotifier`] discards them.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// A published cache event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The `{type, data, timestamp}` shape handed to external sinks.
    pub fn to_json(&self) -> Value {
        let timestamp = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        json!({
            "id": self.id,
            "type": self.name(),
            "data": self.kind.data(),
            "timestamp": timestamp,
        })
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventKind {
    CacheHit {
        store: String,
        key: String,
    },
    CacheMiss {
        store: String,
        key: String,
    },
    CacheSet {
        store: String,
        key: String,
    },
    CacheDelete {
        store: String,
        key: String,
    },
    CacheClear {
        store: String,
        namespace: Option<String>,
        removed: usize,
    },
    CacheEvict {
        store: String,
        key: String,
        reason: String,
    },
    CacheError {
        store: String,
        operation: String,
        message: String,
    },
    LayerAdded {
        layer: String,
        priority: i32,
    },
    LayerRemoved {
        layer: String,
    },
    LayerToggled {
        layer: String,
        enabled: bool,
    },
    InvalidationCompleted {
        strategy: String,
        invalidated_keys: usize,
        invalidated_namespaces: usize,
        invalidated_tags: usize,
        elapsed_ms: f64,
    },
    InvalidationFailed {
        strategy: String,
        error: String,
    },
    InvalidationStats {
        total: u64,
        successful: u64,
        failed: u64,
        active_rules: usize,
        average_time_ms: f64,
    },
    RuleSkipped {
        rule_id: String,
        reason: String,
    },
    RuleAdded {
        rule_id: String,
        name: String,
    },
    RuleRemoved {
        rule_id: String,
    },
    RuleUpdated {
        rule_id: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::CacheSet { .. } => "cache_set",
            Self::CacheDelete { .. } => "cache_delete",
            Self::CacheClear { .. } => "cache_clear",
            Self::CacheEvict { .. } => "cache_evict",
            Self::CacheError { .. } => "cache_error",
            Self::LayerAdded { .. } => "layer_added",
            Self::LayerRemoved { .. } => "layer_removed",
            Self::LayerToggled { .. } => "layer_toggled",
            Self::InvalidationCompleted { .. } => "invalidation.completed",
            Self::InvalidationFailed { .. } => "invalidation.failed",
            Self::InvalidationStats { .. } => "invalidation.stats",
            Self::RuleSkipped { .. } => "invalidation.rule_skipped",
            Self::RuleAdded { .. } => "rule_added",
            Self::RuleRemoved { .. } => "rule_removed",
            Self::RuleUpdated { .. } => "rule_updated",
        }
    }

    /// Structured payload for the event.
    pub fn data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Sink for cache events.
pub trait Notifier: Send + Sync {
    fn publish(&self, kind: EventKind);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _kind: EventKind) {}
}

/// Bounded in-memory event buffer.
///
/// When full, the oldest event is dropped to make room and the drop is
/// counted. A consumer drains events in FIFO order.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    limit: NonZeroUsize,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            limit,
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events: Vec<_> = queue.drain(..count).collect();
        gauge!("tiercache_event_queue_len").set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!("tiercache_event_queue_len").set(0.0);
    }
}

impl Notifier for EventQueue {
    fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_type = event.name(),
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit.get() {
            if let Some(oldest) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("tiercache_event_dropped_total").increment(1);
                warn!(
                    dropped_event = oldest.name(),
                    dropped_epoch = oldest.epoch,
                    limit = self.limit.get(),
                    "Event queue full; dropped oldest event"
                );
            }
        }
        queue.push_back(event);
        gauge!("tiercache_event_queue_len").set(queue.len() as f64);
    }
}
