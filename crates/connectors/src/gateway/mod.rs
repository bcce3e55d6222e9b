//! Pooled, guarded execution of read-only SQL.
//!
//! [`PoolRegistry`] owns one backend (connection pool) and one circuit
//! breaker per datasource id, both created on first use and shared by every
//! request. [`QueryGateway`] runs each call as breaker check, retry loop,
//! single outcome report.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use askql_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use askql_common::config::{BreakerSettings, DatasourceConfig};
use askql_common::models::{QueryRequest, QueryResult};
use askql_common::retry::{guarded, RetryPolicy};
use askql_common::scrubber::scrub;

use crate::error::GatewayError;
use crate::sources::{BackendFactory, FetchedRows, SqlBackend};
use crate::sql_text::validate_readonly;

mod catalog;

struct PoolEntry {
    backend: Arc<dyn SqlBackend>,
    breaker: CircuitBreaker,
}

/// Per-datasource pools and breakers, constructed once at startup.
pub struct PoolRegistry {
    factory: Arc<dyn BackendFactory>,
    datasources: HashMap<String, DatasourceConfig>,
    breaker: BreakerSettings,
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
}

impl PoolRegistry {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        datasources: Vec<DatasourceConfig>,
        breaker: BreakerSettings,
    ) -> Self {
        Self {
            factory,
            datasources: datasources.into_iter().map(|d| (d.id.clone(), d)).collect(),
            breaker,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn datasource(&self, id: &str) -> Option<&DatasourceConfig> {
        self.datasources.get(id)
    }

    pub fn datasource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.datasources.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn entry(&self, id: &str) -> Result<Arc<PoolEntry>, GatewayError> {
        if let Some(entry) = self.pools.read().await.get(id) {
            return Ok(entry.clone());
        }

        let ds = self
            .datasources
            .get(id)
            .ok_or_else(|| GatewayError::UnknownDatasource(id.to_string()))?;

        let mut pools = self.pools.write().await;
        // Another caller may have created it while we waited for the lock.
        if let Some(entry) = pools.get(id) {
            return Ok(entry.clone());
        }

        let backend = self.factory.create(ds)?;
        let entry = Arc::new(PoolEntry {
            backend,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                format!("{}:{}", self.factory.type_name(), id),
                &self.breaker,
            )),
        });
        pools.insert(id.to_string(), entry.clone());
        info!(datasource = %id, backend = self.factory.type_name(), "pool created");
        Ok(entry)
    }

    /// `None` until the datasource's pool has been created.
    pub async fn breaker_state(&self, id: &str) -> Option<CircuitState> {
        let entry = self.pools.read().await.get(id).cloned();
        match entry {
            Some(e) => Some(e.breaker.state().await),
            None => None,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<PoolEntry>)> = self.pools.write().await.drain().collect();
        for (id, entry) in drained {
            entry.backend.close().await;
            debug!(datasource = %id, "pool closed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub retry: RetryPolicy,
    /// Wall-clock limit for catalog reads and previews.
    pub catalog_timeout: Duration,
}

pub struct QueryGateway {
    registry: Arc<PoolRegistry>,
    settings: GatewaySettings,
}

impl QueryGateway {
    pub fn new(registry: Arc<PoolRegistry>, settings: GatewaySettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Validate, then run one statement under the datasource's breaker and
    /// retry policy. The result never holds more than `max_rows` rows.
    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, GatewayError> {
        validate_readonly(&request.sql)?;

        let entry = self.registry.entry(&request.datasource_id).await?;
        let started = tokio::time::Instant::now();
        let (columns, mut rows) = self
            .guarded_fetch(
                &entry,
                "execute",
                &request.sql,
                request.max_rows,
                request.timeout,
            )
            .await
            .inspect_err(|e| {
                warn!(
                    target: "queries",
                    datasource = %request.datasource_id,
                    error = %e,
                    sql = %scrub(&request.sql),
                    "query failed"
                );
            })?;
        rows.truncate(request.max_rows);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            target: "queries",
            datasource = %request.datasource_id,
            rows = rows.len(),
            elapsed_ms,
            sql = %scrub(&request.sql),
            "query executed"
        );

        Ok(QueryResult {
            columns,
            rows,
            elapsed_ms,
        })
    }

    /// `SELECT 1` through the guarded path; never errors.
    pub async fn ping(&self, datasource_id: &str) -> bool {
        let request = QueryRequest {
            datasource_id: datasource_id.to_string(),
            sql: "SELECT 1".to_string(),
            max_rows: 1,
            timeout: self.settings.catalog_timeout,
        };
        match self.execute(&request).await {
            Ok(_) => true,
            Err(e) => {
                debug!(datasource = %datasource_id, error = %e, "ping failed");
                false
            }
        }
    }

    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }

    async fn guarded_fetch(
        &self,
        entry: &PoolEntry,
        operation: &str,
        sql: &str,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<FetchedRows, GatewayError> {
        let exec_cap = (!timeout.is_zero()).then_some(timeout);
        guarded(
            operation,
            &entry.breaker,
            &self.settings.retry,
            GatewayError::is_retryable,
            || with_timeout(timeout, entry.backend.fetch(sql, max_rows, exec_cap)),
        )
        .await
    }

    /// Catalog reads share the datasource breaker and retry policy.
    async fn guarded_catalog<T, F, Fut>(
        &self,
        datasource_id: &str,
        operation: &str,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Arc<dyn SqlBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let entry = self.registry.entry(datasource_id).await?;
        let timeout = self.settings.catalog_timeout;
        guarded(
            operation,
            &entry.breaker,
            &self.settings.retry,
            GatewayError::is_retryable,
            || with_timeout(timeout, op(entry.backend.clone())),
        )
        .await
    }
}

/// Zero means no wall-clock limit.
async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, GatewayError>
where
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}
