//! askql server: the HTTP face of the question-to-SQL pipeline.
//!
//! - **Chat (SSE)**: `POST /api/chat/sse` streams orchestrator events.
//! - **SQL**: `POST /api/sql/execute` runs caller-written read-only SQL.
//! - **Schema & audits**: table listing, previews, drift history, audit log.
//! - **Observability**: `/health`, `/ready` and Prometheus `/metrics`.
use anyhow::Context;
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use askql_common::config::AppConfig;
use askql_common::index::IndexCatalog;
use askql_common::masking::Masker;
use askql_connectors::sources::sql::{MySqlBackendFactory, MySqlPoolSettings};
use askql_connectors::{GatewaySettings, PoolRegistry, QueryGateway, SchemaDriftMonitor};
use askql_runtime::collaborators::SqlAssistant;
use askql_runtime::llm::{LlmAnalyst, LlmSqlAssistant, LlmSqlGenerator, OpenAiChatClient, OpenAiEmbeddingClient};
use askql_runtime::{
    BasicChartAdvisor, Collaborators, Embedder, MemoryIndexCatalog, Orchestrator,
    OrchestratorSettings, Stores,
};
use askql_store::SqliteStore;

pub mod api;
pub mod drift;
pub mod error;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod state;

pub use error::ApiError;
pub use identity::Caller;
pub use state::AppState;

/// `/health`, `/ready`, `/metrics` plus the API nested under `/api`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api", api::create_api_router(state))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

pub struct AskqlServer {
    config_path: String,
}

impl Default for AskqlServer {
    fn default() -> Self {
        Self {
            config_path: "config/askql.yaml".to_string(),
        }
    }
}

impl AskqlServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config_path: impl Into<String>) -> Self {
        self.config_path = config_path.into();
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = AppConfig::from_file(&self.config_path)?;
        logging::init_tracing(&config.server.log_dir, &config.telemetry)?;

        let store = Arc::new(
            SqliteStore::open(&config.server.store_path)
                .await
                .with_context(|| format!("Failed to open store at {}", config.server.store_path))?,
        );
        let state = build_state(&config, store)?;
        let datasource_ids = state.gateway.registry().datasource_ids();

        let drift_task = drift::spawn_drift_loop(
            state.monitor.clone(),
            datasource_ids.clone(),
            Duration::from_secs(config.schema_monitor.poll_secs),
            config.schema_monitor.enabled,
        );

        let gateway = state.gateway.clone();
        let addr: SocketAddr = config
            .server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {}", config.server.listen_addr))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(
            %addr,
            datasources = ?datasource_ids,
            drift_monitor = config.schema_monitor.enabled,
            "askql server listening"
        );

        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        drift_task.abort();
        gateway.close_all().await;
        askql_common::telemetry::shutdown_telemetry();
        info!("askql server stopped");
        Ok(())
    }
}

/// Wire the gateway, retrieval indexes, LLM collaborators and stores.
pub fn build_state(config: &AppConfig, store: Arc<SqliteStore>) -> anyhow::Result<AppState> {
    let factory = Arc::new(MySqlBackendFactory::new(MySqlPoolSettings::from(&config.mysql)));
    let registry = PoolRegistry::new(
        factory,
        config.datasources.clone(),
        config.mysql.breaker,
    );
    let gateway = Arc::new(QueryGateway::new(
        Arc::new(registry),
        GatewaySettings {
            retry: config.mysql.retry.into(),
            catalog_timeout: Duration::from_secs(config.limits.query_timeout_secs),
        },
    ));

    let embedder: Option<Arc<dyn Embedder>> = if config.embedding.is_configured() {
        Some(Arc::new(
            OpenAiEmbeddingClient::from_settings(&config.embedding)
                .context("Invalid embedding settings")?,
        ))
    } else {
        info!("no embedding endpoint configured; retrieval uses token overlap");
        None
    };
    let indexes: Arc<dyn IndexCatalog> = Arc::new(MemoryIndexCatalog::new(embedder));

    let chat = Arc::new(
        OpenAiChatClient::from_settings(&config.llm).context("Invalid LLM chat settings")?,
    );
    let assistant_on = config.assistant.explain || config.assistant.suggest || config.assistant.fix;
    let assistant: Option<Arc<dyn SqlAssistant>> = if assistant_on {
        Some(Arc::new(LlmSqlAssistant::new(chat.clone())))
    } else {
        None
    };
    let collaborators = Collaborators {
        generator: Arc::new(LlmSqlGenerator::new(chat.clone())),
        analyst: Arc::new(LlmAnalyst::new(chat)),
        assistant,
        charts: Arc::new(BasicChartAdvisor),
    };

    let masker = Masker::new(&config.masking);
    let orchestrator = Arc::new(Orchestrator::new(
        gateway.clone(),
        indexes.clone(),
        collaborators,
        Stores {
            conversations: store.clone(),
            audits: store.clone(),
            access: store.clone(),
        },
        masker.clone(),
        OrchestratorSettings {
            limits: config.limits.clone(),
            assistant: config.assistant,
        },
    ));
    let monitor = Arc::new(SchemaDriftMonitor::new(
        gateway.clone(),
        store.clone(),
        indexes,
        Duration::from_secs(config.schema_monitor.interval_hours.saturating_mul(3600)),
    ));

    Ok(AppState {
        orchestrator,
        gateway,
        monitor,
        audits: store.clone(),
        access: store.clone(),
        snapshots: store,
        masker,
        default_datasource: config.default_datasource().map(|d| d.id.clone()),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "errors", error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
