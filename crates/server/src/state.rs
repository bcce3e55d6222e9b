use std::sync::Arc;

use askql_common::masking::Masker;
use askql_common::store::{AccessStore, AuditStore, SnapshotStore};
use askql_connectors::{QueryGateway, SchemaDriftMonitor};
use askql_runtime::Orchestrator;

/// Everything a handler can reach. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<QueryGateway>,
    pub monitor: Arc<SchemaDriftMonitor>,
    pub audits: Arc<dyn AuditStore>,
    pub access: Arc<dyn AccessStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Masks preview rows the same way query results are masked.
    pub masker: Masker,
    /// Used when a request carries no `x-datasource-id` header.
    pub default_datasource: Option<String>,
}
