use thiserror::Error;

/// Result alias used throughout the cache engine.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the cache engine.
///
/// Key construction, strategy parsing, rule lookup and store binding errors are
/// precondition failures and are returned to the caller. `StoreOperation` and
/// `Timeout` describe runtime tier failures; the tiered manager and the
/// invalidation engine catch those at the point of use and degrade instead of
/// propagating them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid cache key: {reason}")]
    InvalidKey { reason: String },
    #[error("unsupported strategy `{0}`")]
    UnsupportedStrategy(String),
    #[error("invalidation rule `{0}` not found")]
    RuleNotFound(String),
    #[error("no cache store is bound to the invalidation engine")]
    NoStoreBound,
    #[error("store `{store}` operation failed: {message}")]
    StoreOperation { store: String, message: String },
    #[error("store `{store}` did not respond within {elapsed_ms}ms")]
    Timeout { store: String, elapsed_ms: u64 },
    #[error("cache layer `{0}` already exists")]
    LayerExists(String),
    #[error("cache layer `{0}` not found")]
    LayerNotFound(String),
    #[error("invalid rule `{rule_id}`: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

impl CacheError {
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreOperation {
            store: store.into(),
            message: message.into(),
        }
    }

    pub fn invalid_rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for runtime tier failures that callers are expected to absorb.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::StoreOperation { .. } | Self::Timeout { .. })
    }
}

/// Process-level failure reported once by the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] crate::config::LoadError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
