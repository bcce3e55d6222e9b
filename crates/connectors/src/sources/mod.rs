//! Database backends behind the query gateway.
//!
//! A backend owns one connection pool for one datasource. The gateway never
//! talks to a driver directly; it goes through [`SqlBackend`], created on
//! first use by the registry's [`BackendFactory`].
//!
//! | Backend  | Implementation        |
//! |----------|-----------------------|
//! | `mysql`  | [`sql::mysql::MySqlBackend`] |
//!
//! # Adding a Backend
//!
//! 1. Implement [`SqlBackend`] over the driver's pool.
//! 2. Implement [`BackendFactory`] to build it from a [`DatasourceConfig`].
//! 3. Hand the factory to [`crate::gateway::PoolRegistry::new`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use askql_common::config::DatasourceConfig;
use askql_common::models::{ColumnInfo, TableInfo};

use crate::error::GatewayError;

pub mod schema_drift;
pub mod sql;

/// Column names plus row-major values.
pub type FetchedRows = (Vec<String>, Vec<Vec<Value>>);

#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run one statement and read at most `max_rows` rows.
    ///
    /// `exec_cap` is a server-side execution limit applied best-effort;
    /// backends that cannot set one ignore it.
    async fn fetch(
        &self,
        sql: &str,
        max_rows: usize,
        exec_cap: Option<Duration>,
    ) -> Result<FetchedRows, GatewayError>;

    /// Every relation of the connected schema, ordered by name.
    async fn list_tables(&self) -> Result<Vec<TableInfo>, GatewayError>;

    /// Columns ordered by table then ordinal position.
    async fn list_columns(&self, table: Option<&str>) -> Result<Vec<ColumnInfo>, GatewayError>;

    async fn close(&self);
}

pub trait BackendFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn create(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn SqlBackend>, GatewayError>;
}
