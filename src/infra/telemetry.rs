use std::{io, sync::Once};

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
/// Logs go to stderr; stdout is reserved for image bytes in client mode.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pdfrasterizer_requests_total",
            Unit::Count,
            "Total number of accepted rasterization requests, by output format."
        );
        describe_counter!(
            "pdfrasterizer_rejected_total",
            Unit::Count,
            "Total number of rasterization requests rejected before rendering."
        );
        describe_counter!(
            "pdfrasterizer_render_failures_total",
            Unit::Count,
            "Total number of renderer failures after the response was committed."
        );
        describe_counter!(
            "pdfrasterizer_stream_failures_total",
            Unit::Count,
            "Total number of failures copying rendered output to the client."
        );
        describe_histogram!(
            "pdfrasterizer_render_ms",
            Unit::Milliseconds,
            "Renderer wall-clock time in milliseconds."
        );
        describe_histogram!(
            "pdfrasterizer_streamed_bytes",
            Unit::Bytes,
            "Image bytes streamed per request."
        );
    });
}
