//! Value, option and report types shared by every cache tier.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use super::eviction::EvictionStrategy;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct CacheValue<V> {
    pub value: V,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub access_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Per-call write options.
///
/// `ttl: None` uses the store's default TTL; `Some(Duration::ZERO)` never
/// expires. `strategy` is recorded on the entry but does not change which
/// entry the store evicts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub strategy: Option<EvictionStrategy>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn never_expire() -> Self {
        Self::with_ttl(Duration::ZERO)
    }

    pub fn strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Counters reported by a store or aggregated by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
    pub total_size: usize,
    pub average_size: f64,
    pub evicted_entries: u64,
    pub expired_entries: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_reset: OffsetDateTime,
    /// Extra counters (manager-level) keyed by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Per-layer stats, keyed by layer name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub layers: BTreeMap<String, CacheStats>,
}

impl CacheStats {
    pub fn empty(last_reset: OffsetDateTime) -> Self {
        Self {
            hits: 0,
            misses: 0,
            hit_rate: 0.0,
            entry_count: 0,
            total_size: 0,
            average_size: 0.0,
            evicted_entries: 0,
            expired_entries: 0,
            last_reset,
            counters: BTreeMap::new(),
            layers: BTreeMap::new(),
        }
    }

    /// `hits / (hits + misses)`, or 0 when nothing was requested.
    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn compute_average_size(total_size: usize, entry_count: usize) -> f64 {
        if entry_count == 0 {
            0.0
        } else {
            total_size as f64 / entry_count as f64
        }
    }
}

/// Health probe result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub connected: bool,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_check_time: OffsetDateTime,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub layers: BTreeMap<String, CacheHealth>,
}

impl CacheHealth {
    pub fn healthy(response_time_ms: f64) -> Self {
        Self {
            healthy: true,
            connected: true,
            response_time_ms,
            error: None,
            last_check_time: OffsetDateTime::now_utc(),
            layers: BTreeMap::new(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            connected: false,
            response_time_ms: 0.0,
            error: Some(error.into()),
            last_check_time: OffsetDateTime::now_utc(),
            layers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_zero_requests() {
        assert_eq!(CacheStats::compute_hit_rate(0, 0), 0.0);
        assert_eq!(CacheStats::compute_hit_rate(3, 1), 0.75);
    }

    #[test]
    fn average_size_handles_empty_store() {
        assert_eq!(CacheStats::compute_average_size(0, 0), 0.0);
        assert_eq!(CacheStats::compute_average_size(30, 3), 10.0);
    }

    #[test]
    fn set_options_builders() {
        let opts = SetOptions::never_expire()
            .strategy(EvictionStrategy::Lfu)
            .tag("hot")
            .meta("origin", "test");
        assert_eq!(opts.ttl, Some(Duration::ZERO));
        assert_eq!(opts.strategy, Some(EvictionStrategy::Lfu));
        assert_eq!(opts.tags, vec!["hot".to_string()]);
        assert_eq!(opts.metadata.get("origin").map(String::as_str), Some("test"));
    }

    #[test]
    fn stats_serialize_without_empty_maps() {
        let stats = CacheStats::empty(OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_value(&stats).expect("serialize");
        assert!(json.get("layers").is_none());
        assert_eq!(json["last_reset"], "1970-01-01T00:00:00Z");
    }
}
