//! # Schema Drift Detection
//!
//! Keeps each datasource's retrieval index consistent with the live catalog.
//!
//! ## Overview
//!
//! [`SchemaDriftMonitor::check`] reads tables and columns, serializes them
//! into a canonical `{table: {comment, type, columns}}` map and diffs it
//! against the last stored snapshot:
//! - **Added**: tables present now but not before.
//! - **Removed**: tables present before but not now.
//! - **Changed**: tables in both whose serialized shape differs.
//!
//! A non-empty diff appends a change record and triggers a partial reindex:
//! only added and changed tables are re-pushed, removed ones are purged.
//! The new snapshot replaces the old one whether or not every per-table
//! reindex succeeded.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use askql_common::index::{table_doc_id, IndexCatalog};
use askql_common::models::{ColumnInfo, SchemaChangeRecord, SchemaSnapshot, TableInfo};
use askql_common::store::SnapshotStore;
use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode};

use crate::error::GatewayError;
use crate::gateway::QueryGateway;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("snapshot store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("retrieval index error: {0}")]
    Index(#[source] anyhow::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Classify for DriftError {
    fn class(&self) -> ErrorClass {
        match self {
            DriftError::Gateway(e) => e.class(),
            _ => ErrorClass::Internal,
        }
    }
}

impl From<DriftError> for AskqlError {
    fn from(err: DriftError) -> Self {
        match err {
            DriftError::Gateway(e) => e.into(),
            DriftError::Store(e) => AskqlError::new(ErrorCode::StorageFailed, e.to_string()),
            DriftError::Index(e) => AskqlError::new(ErrorCode::InternalPanic, e.to_string()),
            DriftError::Serialize(e) => {
                AskqlError::new(ErrorCode::SerializationFailed, e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    pub key: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableShape {
    pub comment: String,
    #[serde(rename = "type")]
    pub table_type: String,
    pub columns: Vec<ColumnShape>,
}

/// Table name to shape; `BTreeMap` so the serialized form is stable.
pub type CanonicalSchema = BTreeMap<String, TableShape>;

pub fn canonical_schema(tables: &[TableInfo], columns: &[ColumnInfo]) -> CanonicalSchema {
    let mut by_table: BTreeMap<&str, Vec<ColumnShape>> = BTreeMap::new();
    for c in columns {
        by_table.entry(c.table.as_str()).or_default().push(ColumnShape {
            name: c.column.clone(),
            column_type: c.column_type.clone(),
            nullable: c.nullable,
            key: c.key.clone(),
            comment: c.comment.clone(),
        });
    }

    tables
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            let shape = TableShape {
                comment: t.comment.clone(),
                table_type: t.table_type.clone(),
                columns: by_table.remove(t.name.as_str()).unwrap_or_default(),
            };
            (t.name.clone(), shape)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// `(added ∪ changed) − removed`, sorted.
    pub fn reindex_targets(&self) -> Vec<String> {
        let removed: BTreeSet<&String> = self.removed.iter().collect();
        self.added
            .iter()
            .chain(self.changed.iter())
            .filter(|t| !removed.contains(t))
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }
}

/// Compare two snapshots keyed by table; values are compared structurally.
pub fn diff_schemas<V: PartialEq>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
) -> SchemaDiff {
    let added = new.keys().filter(|k| !old.contains_key(*k)).cloned().collect();
    let removed = old.keys().filter(|k| !new.contains_key(*k)).cloned().collect();
    let changed = old
        .iter()
        .filter(|(k, v)| new.get(*k).is_some_and(|nv| nv != *v))
        .map(|(k, _)| k.clone())
        .collect();
    SchemaDiff {
        added,
        removed,
        changed,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftOutcome {
    /// Last snapshot is younger than the check interval.
    Skipped,
    /// No previous snapshot; the current schema was stored as the baseline.
    Baseline { tables: usize },
    Unchanged,
    Changed {
        diff: SchemaDiff,
        reindexed: Vec<String>,
        failed: Vec<String>,
    },
}

pub struct SchemaDriftMonitor {
    gateway: Arc<QueryGateway>,
    snapshots: Arc<dyn SnapshotStore>,
    indexes: Arc<dyn IndexCatalog>,
    interval: Duration,
}

impl SchemaDriftMonitor {
    pub fn new(
        gateway: Arc<QueryGateway>,
        snapshots: Arc<dyn SnapshotStore>,
        indexes: Arc<dyn IndexCatalog>,
        interval: Duration,
    ) -> Self {
        Self {
            gateway,
            snapshots,
            indexes,
            interval,
        }
    }

    /// Check one datasource. `force` ignores the interval gate.
    pub async fn check(&self, datasource_id: &str, force: bool) -> Result<DriftOutcome, DriftError> {
        let previous = self
            .snapshots
            .latest_snapshot(datasource_id)
            .await
            .map_err(DriftError::Store)?;

        if let Some(prev) = &previous {
            let age = Utc::now().signed_duration_since(prev.checked_at);
            let fresh = age.to_std().map(|a| a < self.interval).unwrap_or(true);
            if !force && !self.interval.is_zero() && fresh {
                return Ok(DriftOutcome::Skipped);
            }
        }

        let tables = self.gateway.list_tables(datasource_id).await?;
        let columns = self.gateway.list_columns(datasource_id, None).await?;
        let current = canonical_schema(&tables, &columns);
        let current_value: BTreeMap<String, Value> = current
            .iter()
            .map(|(k, v)| serde_json::to_value(v).map(|v| (k.clone(), v)))
            .collect::<Result<_, serde_json::Error>>()?;
        let snapshot = SchemaSnapshot {
            datasource_id: datasource_id.to_string(),
            schema_json: serde_json::to_string(&current_value)?,
            checked_at: Utc::now(),
        };

        let outcome = match previous {
            None => DriftOutcome::Baseline {
                tables: current.len(),
            },
            Some(prev) => {
                let old: BTreeMap<String, Value> = serde_json::from_str(&prev.schema_json)
                    .unwrap_or_else(|e| {
                        warn!(
                            target: "schema_drift",
                            datasource = %datasource_id,
                            error = %e,
                            "stored snapshot unreadable; diffing against empty schema"
                        );
                        BTreeMap::new()
                    });
                let diff = diff_schemas(&old, &current_value);
                if diff.is_empty() {
                    DriftOutcome::Unchanged
                } else {
                    self.apply_diff(datasource_id, diff).await
                }
            }
        };

        self.snapshots
            .save_snapshot(&snapshot)
            .await
            .map_err(DriftError::Store)?;

        info!(
            target: "schema_drift",
            datasource = %datasource_id,
            outcome = ?outcome,
            "schema check finished"
        );
        Ok(outcome)
    }

    /// Log the change and reindex the affected tables. Failures here are
    /// logged; the caller still replaces the snapshot.
    async fn apply_diff(&self, datasource_id: &str, diff: SchemaDiff) -> DriftOutcome {
        let record = SchemaChangeRecord {
            datasource_id: datasource_id.to_string(),
            added: diff.added.clone(),
            removed: diff.removed.clone(),
            changed: diff.changed.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.snapshots.append_change(&record).await {
            warn!(
                target: "schema_drift",
                datasource = %datasource_id,
                error = %e,
                "change log write failed"
            );
        }

        let index = self.indexes.index_for(datasource_id);
        let mut reindexed = Vec::new();
        let mut failed = Vec::new();

        for table in diff.reindex_targets() {
            let pushed = match self
                .gateway
                .schema_document_for_table(datasource_id, &table)
                .await
            {
                Ok(Some(doc)) => index.upsert(vec![doc]).await.map_err(|e| e.to_string()),
                Ok(None) => Ok(()),
                Err(e) => Err(e.to_string()),
            };
            match pushed {
                Ok(()) => reindexed.push(table),
                Err(error) => {
                    warn!(
                        target: "schema_drift",
                        datasource = %datasource_id,
                        table = %table,
                        error = %error,
                        "reindex failed"
                    );
                    failed.push(table);
                }
            }
        }

        if !diff.removed.is_empty() {
            let ids: Vec<String> = diff.removed.iter().map(|t| table_doc_id(t)).collect();
            if let Err(e) = index.delete(&ids).await {
                warn!(
                    target: "schema_drift",
                    datasource = %datasource_id,
                    error = %e,
                    "purging removed tables failed"
                );
            }
        }

        DriftOutcome::Changed {
            diff,
            reindexed,
            failed,
        }
    }

    /// Check every configured datasource; one failure does not stop the rest.
    pub async fn run_all(&self) -> Vec<(String, Result<DriftOutcome, DriftError>)> {
        let mut results = Vec::new();
        for id in self.gateway.registry().datasource_ids() {
            let result = self.check(&id, false).await;
            if let Err(e) = &result {
                warn!(target: "schema_drift", datasource = %id, error = %e, "schema check failed");
            }
            results.push((id, result));
        }
        results
    }

    /// Replace the datasource's index with fresh documents for every table.
    pub async fn rebuild_index(&self, datasource_id: &str) -> Result<usize, DriftError> {
        let docs = self.gateway.schema_documents(datasource_id).await?;
        let index = self.indexes.index_for(datasource_id);
        let count = docs.len();
        index.clear().await.map_err(DriftError::Index)?;
        index.upsert(docs).await.map_err(DriftError::Index)?;
        info!(
            target: "schema_drift",
            datasource = %datasource_id,
            documents = count,
            "retrieval index rebuilt"
        );
        Ok(count)
    }
}
