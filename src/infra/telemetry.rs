use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "artifact_cache_memo_hit_total",
            Unit::Count,
            "Per-request memo lookups answered without a store call."
        );
        describe_counter!(
            "artifact_cache_memo_miss_total",
            Unit::Count,
            "Per-request memo lookups that went to the store."
        );
        describe_counter!(
            "artifact_cache_memo_evict_total",
            Unit::Count,
            "Per-request memo records evicted by count or size pressure."
        );
        describe_counter!(
            "artifact_cache_store_read_total",
            Unit::Count,
            "Durable store reads by outcome (hit, miss, unchanged, error)."
        );
        describe_counter!(
            "artifact_cache_store_write_total",
            Unit::Count,
            "Durable store writes by outcome (ok, error)."
        );
        describe_counter!(
            "artifact_cache_tag_stale_total",
            Unit::Count,
            "Entries found stale by tag revalidation."
        );
        describe_counter!(
            "artifact_cache_background_failed_total",
            Unit::Count,
            "Tracked background tasks that failed or aborted."
        );
        describe_histogram!(
            "artifact_cache_drain_ms",
            Unit::Milliseconds,
            "Time spent draining a request's background work."
        );
    });
}
