//! Per-request orchestration.
//!
//! [`Orchestrator::stream`] turns one chat question into a lazy, finite
//! sequence of [`SessionEvent`]s: retrieval, generation, authorization,
//! execution with bounded repair, post-processing, persistence and exactly
//! one `done`. Nothing runs ahead of the consumer; dropping the stream
//! stops the session at its next suspension point.
//!
//! [`Orchestrator::execute`] runs caller-written SQL through the same
//! allowlist, audit and post-processing path and returns one response.
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use askql_common::config::{AssistantSettings, QueryLimits};
use askql_common::index::IndexCatalog;
use askql_common::masking::Masker;
use askql_common::models::AuditRecord;
use askql_common::scrubber::scrub;
use askql_common::store::{AccessStore, AuditStore, ConversationStore};
use askql_connectors::QueryGateway;

use crate::collaborators::{Analyst, ChartAdvisor, SqlAssistant, SqlGenerator};

mod events;
mod execute;
mod session;

pub use events::{ErrorSite, Event, SessionEvent, Stage, WarningKind};
pub use execute::{ExecuteError, ExecuteRequest, ExecuteResponse};
pub use session::OrchestrationSession;

/// One natural-language question from one caller.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub user: String,
    pub datasource_id: String,
    pub conversation_id: Option<i64>,
    pub question: String,
    /// Saved table scope to intersect the allowlist with.
    pub scope_id: Option<i64>,
    /// Ask the generator to stay inside the allowed tables.
    pub table_lock: bool,
}

pub struct Collaborators {
    pub generator: Arc<dyn SqlGenerator>,
    pub analyst: Arc<dyn Analyst>,
    pub assistant: Option<Arc<dyn SqlAssistant>>,
    pub charts: Arc<dyn ChartAdvisor>,
}

pub struct Stores {
    pub conversations: Arc<dyn ConversationStore>,
    pub audits: Arc<dyn AuditStore>,
    pub access: Arc<dyn AccessStore>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub limits: QueryLimits,
    pub assistant: AssistantSettings,
}

pub struct Orchestrator {
    gateway: Arc<QueryGateway>,
    indexes: Arc<dyn IndexCatalog>,
    collaborators: Collaborators,
    stores: Stores,
    masker: Masker,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<QueryGateway>,
        indexes: Arc<dyn IndexCatalog>,
        collaborators: Collaborators,
        stores: Stores,
        masker: Masker,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            gateway,
            indexes,
            collaborators,
            stores,
            masker,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<QueryGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn session(self: &Arc<Self>, request: ChatRequest) -> OrchestrationSession {
        OrchestrationSession::new(self.clone(), request)
    }

    /// The session as a stream; ends right after the `done` event.
    pub fn stream(self: &Arc<Self>, request: ChatRequest) -> BoxStream<'static, SessionEvent> {
        stream::unfold(self.session(request), |mut session| async move {
            let event = session.next_event().await?;
            Some((event, session))
        })
        .boxed()
    }

    fn assistant_for(&self, enabled: bool) -> Option<&Arc<dyn SqlAssistant>> {
        if enabled {
            self.collaborators.assistant.as_ref()
        } else {
            None
        }
    }

    /// Log the attempt on the `audit` target, then store it.
    async fn record_attempt(&self, record: AuditRecord) {
        info!(
            target: "audit",
            user = %record.user,
            datasource = %record.datasource_id,
            conversation_id = ?record.conversation_id,
            success = record.success,
            row_count = record.row_count,
            elapsed_ms = record.elapsed_ms,
            slow = record.slow,
            error = record.error_message.as_deref().unwrap_or(""),
            sql = %scrub(&record.sql_text),
            "sql audit"
        );
        best_effort("audit write", self.stores.audits.record_audit(&record)).await;
    }
}

/// Await a side-channel write; a failure is logged and becomes `None`.
async fn best_effort<T>(
    what: &'static str,
    write: impl Future<Output = anyhow::Result<T>>,
) -> Option<T> {
    match write.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "{what} failed; continuing");
            None
        }
    }
}
