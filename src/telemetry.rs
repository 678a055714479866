use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every metric the engine emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tiercache_store_hit_total",
            Unit::Count,
            "Total number of store reads that found a live entry."
        );
        describe_counter!(
            "tiercache_store_miss_total",
            Unit::Count,
            "Total number of store reads that found nothing or an expired entry."
        );
        describe_counter!(
            "tiercache_store_evict_total",
            Unit::Count,
            "Total number of entries evicted to make room."
        );
        describe_counter!(
            "tiercache_store_expire_total",
            Unit::Count,
            "Total number of entries removed because their TTL elapsed."
        );
        describe_counter!(
            "tiercache_layer_error_total",
            Unit::Count,
            "Total number of failed or timed-out layer calls absorbed by the manager."
        );
        describe_counter!(
            "tiercache_promotion_total",
            Unit::Count,
            "Total number of values copied into a higher-priority layer."
        );
        describe_counter!(
            "tiercache_event_dropped_total",
            Unit::Count,
            "Total number of cache events dropped due to queue overflow."
        );
        describe_gauge!(
            "tiercache_event_queue_len",
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_gauge!(
            "tiercache_active_rules",
            Unit::Count,
            "Number of enabled invalidation rules."
        );
        describe_histogram!(
            "tiercache_invalidation_ms",
            Unit::Milliseconds,
            "Invalidation latency in milliseconds."
        );
    });
}
