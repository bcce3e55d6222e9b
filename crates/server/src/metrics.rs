use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "metric registration failed");
    }
    collector
}

pub static CHAT_SESSIONS: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("askql_chat_sessions_total", "Chat sessions started");
    register(IntCounter::with_opts(opts).expect("valid counter opts"))
});

pub static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    let opts = Opts::new("askql_active_streams", "Chat event streams currently open");
    register(IntGauge::with_opts(opts).expect("valid gauge opts"))
});

pub static SQL_EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "askql_sql_executions_total",
        "Synchronous SQL executions by outcome",
    );
    register(IntCounterVec::new(opts, &["outcome"]).expect("valid counter opts"))
});

/// Holds `ACTIVE_STREAMS` up for as long as it lives.
pub struct StreamGuard(());

impl StreamGuard {
    pub fn new() -> Self {
        ACTIVE_STREAMS.inc();
        Self(())
    }
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        ACTIVE_STREAMS.dec();
    }
}

pub async fn metrics_handler() -> Response {
    Lazy::force(&CHAT_SESSIONS);
    Lazy::force(&ACTIVE_STREAMS);
    Lazy::force(&SQL_EXECUTIONS);

    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(target: "errors", error = %e, "metrics encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
