use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "markdownd_render_total",
            Unit::Count,
            "Completed renders, labelled by fast or slow path."
        );
        describe_histogram!(
            "markdownd_render_ms",
            Unit::Milliseconds,
            "Time from dispatch to a readable result."
        );
        describe_counter!(
            "markdownd_render_incomplete_total",
            Unit::Count,
            "Instance renders read back without an observed completion."
        );
        describe_counter!(
            "markdownd_render_failures_total",
            Unit::Count,
            "Renders that returned an engine error."
        );
        describe_counter!(
            "markdownd_connections_total",
            Unit::Count,
            "Finished connections, labelled by outcome."
        );
        describe_histogram!(
            "markdownd_request_bytes",
            Unit::Bytes,
            "Size of request payloads received before half-close."
        );
        describe_counter!(
            "markdownd_worker_exits_total",
            Unit::Count,
            "Worker exits observed by the supervisor, labelled by reason."
        );
        describe_counter!(
            "markdownd_worker_restarts_total",
            Unit::Count,
            "Workers relaunched by the supervisor."
        );
        describe_gauge!(
            "markdownd_workers_running",
            Unit::Count,
            "Worker slots currently managed by the supervisor."
        );
    });
}
