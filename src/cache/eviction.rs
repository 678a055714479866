//! Eviction strategy selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Policy used to pick a victim when a bounded store is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used. Ties go to whichever entry the backing map
    /// yields first, so the victim among equal counts is unspecified.
    Lfu,
    /// Earliest insertion.
    Fifo,
    /// Earliest expiry. Falls back to FIFO when no entry has an expiry.
    Ttl,
}

impl EvictionStrategy {
    pub const ALL: [EvictionStrategy; 4] = [Self::Lru, Self::Lfu, Self::Fifo, Self::Ttl];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
            Self::Ttl => "ttl",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            "ttl" => Ok(Self::Ttl),
            other => Err(CacheError::UnsupportedStrategy(other.to_string())),
        }
    }
}
