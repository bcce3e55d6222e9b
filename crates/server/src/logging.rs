//! Subscriber setup.
//!
//! Human-readable logs go to stdout under `RUST_LOG`. Events on the
//! `audit`, `queries`, `schema_drift` and `errors` targets are also written
//! as JSON lines to daily-rolled files in the configured log directory.
use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use askql_common::config::TelemetryConfig;

const FILE_TARGETS: [(&str, &str); 4] = [
    ("audit", "audit.jsonl"),
    ("queries", "queries.jsonl"),
    ("schema_drift", "schema_drift.jsonl"),
    ("errors", "errors.jsonl"),
];

fn target_layer<S>(log_dir: &str, target: &'static str, file: &str) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let appender = tracing_appender::rolling::daily(log_dir, file);
    tracing_subscriber::fmt::layer()
        .json()
        .with_writer(appender)
        .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
            metadata.target() == target
        }))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(log_dir: &str, telemetry: &TelemetryConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {log_dir}"))?;

    let otel_layer = askql_common::telemetry::init_telemetry(telemetry)?;
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let [audit, queries, drift, errors] = FILE_TARGETS;

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(otel_layer)
        .with(target_layer(log_dir, audit.0, audit.1))
        .with(target_layer(log_dir, queries.0, queries.1))
        .with(target_layer(log_dir, drift.0, drift.1))
        .with(target_layer(log_dir, errors.0, errors.1))
        .try_init()
        .ok();
    Ok(())
}
