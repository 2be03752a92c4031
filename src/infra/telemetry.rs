use std::sync::Once;

use metrics::{Unit, describe_counter};
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
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "matryoshka_fragment_hit_total",
            Unit::Count,
            "Total number of fragments served from the cache."
        );
        describe_counter!(
            "matryoshka_fragment_miss_total",
            Unit::Count,
            "Total number of fragment lookups that had to render."
        );
        describe_counter!(
            "matryoshka_fragment_bypass_total",
            Unit::Count,
            "Total number of fragments rendered without a cache key or with the cache disabled."
        );
        describe_counter!(
            "matryoshka_fragment_store_conflict_total",
            Unit::Count,
            "Total number of fragment stores skipped because another render stored first."
        );
        describe_counter!(
            "matryoshka_fragment_backend_error_total",
            Unit::Count,
            "Total number of failed fragment backend reads and writes."
        );
        describe_counter!(
            "matryoshka_fragment_evict_total",
            Unit::Count,
            "Total number of in-memory fragment evictions due to capacity."
        );
        describe_counter!(
            "matryoshka_cascade_touch_total",
            Unit::Count,
            "Total number of dependent entities re-persisted by the invalidation cascade."
        );
    });
}
