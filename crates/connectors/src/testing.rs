//! In-process doubles for the backend seam and the retrieval index.
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream crates that need a gateway without a live MySQL server.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use askql_common::config::{BreakerSettings, DatasourceConfig};
use askql_common::index::{IndexCatalog, RetrievalIndex};
use askql_common::models::{ColumnInfo, RetrievalDocument, SearchHit, TableInfo};
use askql_common::retry::RetryPolicy;

use crate::error::GatewayError;
use crate::gateway::{GatewaySettings, PoolRegistry, QueryGateway};
use crate::sources::{BackendFactory, FetchedRows, SqlBackend};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted backend. Queued results are consumed first; afterwards every
/// fetch returns the default result set, ignoring `max_rows`.
#[derive(Default)]
pub struct FakeBackend {
    tables: Mutex<Vec<TableInfo>>,
    columns: Mutex<Vec<ColumnInfo>>,
    script: Mutex<VecDeque<Result<FetchedRows, GatewayError>>>,
    default_result: Mutex<FetchedRows>,
    failing_tables: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    closed: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the catalog with `(table, [(column, column_type)])` entries.
    pub fn set_schema(&self, schema: &[(&str, &[(&str, &str)])]) {
        let mut tables = Vec::new();
        let mut columns = Vec::new();
        for (table, cols) in schema {
            tables.push(TableInfo {
                name: table.to_string(),
                table_type: "BASE TABLE".to_string(),
                comment: String::new(),
            });
            for (name, column_type) in cols.iter() {
                columns.push(ColumnInfo {
                    table: table.to_string(),
                    column: name.to_string(),
                    data_type: column_type.to_string(),
                    column_type: column_type.to_string(),
                    nullable: true,
                    key: String::new(),
                    comment: String::new(),
                });
            }
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        *lock(&self.tables) = tables;
        *lock(&self.columns) = columns;
    }

    pub fn add_view(&self, name: &str) {
        lock(&self.tables).push(TableInfo {
            name: name.to_string(),
            table_type: "VIEW".to_string(),
            comment: String::new(),
        });
    }

    pub fn set_default_result(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        *lock(&self.default_result) = (columns.iter().map(|c| c.to_string()).collect(), rows);
    }

    pub fn push_result(&self, result: Result<FetchedRows, GatewayError>) {
        lock(&self.script).push_back(result);
    }

    pub fn push_error(&self, err: GatewayError) {
        self.push_result(Err(err));
    }

    /// Column reads for `table` fail with a connection error.
    pub fn fail_columns_for(&self, table: &str) {
        lock(&self.failing_tables).insert(table.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.executed).len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlBackend for FakeBackend {
    async fn fetch(
        &self,
        sql: &str,
        _max_rows: usize,
        _exec_cap: Option<Duration>,
    ) -> Result<FetchedRows, GatewayError> {
        lock(&self.executed).push(sql.to_string());
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.script).pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(lock(&self.default_result).clone()),
        }
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, GatewayError> {
        Ok(lock(&self.tables).clone())
    }

    async fn list_columns(&self, table: Option<&str>) -> Result<Vec<ColumnInfo>, GatewayError> {
        if let Some(t) = table {
            if lock(&self.failing_tables).contains(t) {
                return Err(GatewayError::Connection(format!("columns of {t} unavailable")));
            }
        }
        Ok(lock(&self.columns)
            .iter()
            .filter(|c| table.map_or(true, |t| c.table == t))
            .cloned()
            .collect())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands the same [`FakeBackend`] to every datasource.
pub struct FakeFactory {
    backend: Arc<FakeBackend>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BackendFactory for FakeFactory {
    fn type_name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, _ds: &DatasourceConfig) -> Result<Arc<dyn SqlBackend>, GatewayError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.clone())
    }
}

pub fn datasource(id: &str) -> DatasourceConfig {
    DatasourceConfig {
        id: id.to_string(),
        name: id.to_string(),
        host: "localhost".to_string(),
        port: 3306,
        database: id.to_string(),
        user: "reader".to_string(),
        password: None,
        is_default: false,
    }
}

/// Gateway over a fake backend: two retries with millisecond delays and a
/// breaker that opens after `failure_threshold` failed calls.
pub fn fake_gateway(factory: Arc<FakeFactory>, ids: &[&str], failure_threshold: u32) -> QueryGateway {
    let registry = PoolRegistry::new(
        factory,
        ids.iter().map(|id| datasource(id)).collect(),
        BreakerSettings {
            failure_threshold,
            recovery_timeout_secs: 30,
        },
    );
    QueryGateway::new(
        Arc::new(registry),
        GatewaySettings {
            retry: RetryPolicy {
                retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            catalog_timeout: Duration::from_secs(5),
        },
    )
}

/// Index that records every call; search returns documents in id order.
#[derive(Default)]
pub struct RecordingIndex {
    docs: Mutex<HashMap<String, RetrievalDocument>>,
    upserted: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl RecordingIndex {
    pub fn upserted(&self) -> Vec<String> {
        lock(&self.upserted).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.docs).keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl RetrievalIndex for RecordingIndex {
    async fn search(&self, _query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let docs = lock(&self.docs);
        let mut hits: Vec<SearchHit> = docs
            .values()
            .map(|d| SearchHit {
                id: d.id.clone(),
                text: d.text.clone(),
                metadata: d.metadata.clone(),
                distance: 0.0,
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, docs: Vec<RetrievalDocument>) -> Result<()> {
        let mut stored = lock(&self.docs);
        let mut upserted = lock(&self.upserted);
        for doc in docs {
            upserted.push(doc.id.clone());
            stored.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut stored = lock(&self.docs);
        for id in ids {
            stored.remove(id);
            lock(&self.deleted).push(id.clone());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        lock(&self.docs).clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(lock(&self.docs).len())
    }
}

/// One [`RecordingIndex`] per datasource id.
#[derive(Default)]
pub struct RecordingCatalog {
    indexes: Mutex<HashMap<String, Arc<RecordingIndex>>>,
}

impl RecordingCatalog {
    pub fn recording(&self, datasource_id: &str) -> Arc<RecordingIndex> {
        lock(&self.indexes)
            .entry(datasource_id.to_string())
            .or_default()
            .clone()
    }
}

impl IndexCatalog for RecordingCatalog {
    fn index_for(&self, datasource_id: &str) -> Arc<dyn RetrievalIndex> {
        self.recording(datasource_id)
    }
}
