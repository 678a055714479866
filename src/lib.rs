//! Process-local multi-tier cache engine with pluggable eviction, layer
//! promotion and rule-based invalidation.

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;
