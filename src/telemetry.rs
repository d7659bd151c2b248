//! Tracing and metrics installation.
//!
//! Host applications call [`init`] once at startup. Metric descriptions are
//! registered exactly once per process regardless of how many times the
//! subscriber installation is attempted.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::TelemetryError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let directive = logging
        .level
        .parse()
        .map_err(|err| TelemetryError::new(format!("invalid log level directive: {err}")))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
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
            TelemetryError::new(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "agora_sync_fetches_total",
            Unit::Count,
            "Total number of fetch attempts issued to the transport."
        );
        describe_counter!(
            "agora_sync_fetch_retries_total",
            Unit::Count,
            "Total number of fetch attempts retried after a transient failure."
        );
        describe_counter!(
            "agora_sync_cache_hits_total",
            Unit::Count,
            "Total number of reads satisfied by a fresh resident entry."
        );
        describe_counter!(
            "agora_sync_coalesced_waits_total",
            Unit::Count,
            "Total number of requests that joined an in-flight fetch."
        );
        describe_counter!(
            "agora_sync_stale_discards_total",
            Unit::Count,
            "Total number of fetch results discarded as superseded."
        );
        describe_counter!(
            "agora_sync_evictions_total",
            Unit::Count,
            "Total number of entries evicted by the expiry sweeper."
        );
        describe_counter!(
            "agora_sync_mutations_total",
            Unit::Count,
            "Total number of settled mutations, labelled by outcome."
        );
        describe_counter!(
            "agora_sync_rollbacks_total",
            Unit::Count,
            "Total number of optimistic applications rolled back."
        );
        describe_counter!(
            "agora_sync_invalidations_total",
            Unit::Count,
            "Total number of resident entries marked stale by invalidation."
        );
        describe_histogram!(
            "agora_sync_fetch_ms",
            Unit::Milliseconds,
            "Wall time of a fetch including retries and backoff."
        );
        describe_histogram!(
            "agora_sync_mutation_settle_ms",
            Unit::Milliseconds,
            "Wall time of a mutation's network round trip."
        );
        describe_gauge!(
            "agora_sync_resident_entries",
            Unit::Count,
            "Current number of entries resident in the store."
        );
    });
}
