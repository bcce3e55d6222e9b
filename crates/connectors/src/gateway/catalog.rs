use std::collections::BTreeMap;

use askql_common::index::table_doc_id;
use askql_common::models::{ColumnInfo, QueryRequest, QueryResult, RetrievalDocument, TableInfo};
use askql_error::find_closest_match;

use super::QueryGateway;
use crate::error::GatewayError;
use crate::sql_text::{is_valid_identifier, quote_identifier};

pub const MAX_PREVIEW_ROWS: usize = 100;

impl QueryGateway {
    pub async fn list_tables(&self, datasource_id: &str) -> Result<Vec<TableInfo>, GatewayError> {
        self.guarded_catalog(datasource_id, "list_tables", |backend| async move {
            backend.list_tables().await
        })
        .await
    }

    pub async fn list_columns(
        &self,
        datasource_id: &str,
        table: Option<&str>,
    ) -> Result<Vec<ColumnInfo>, GatewayError> {
        let table = table.map(str::to_string);
        self.guarded_catalog(datasource_id, "list_columns", |backend| {
            let table = table.clone();
            async move { backend.list_columns(table.as_deref()).await }
        })
        .await
    }

    /// One retrieval document per table of the datasource.
    pub async fn schema_documents(
        &self,
        datasource_id: &str,
    ) -> Result<Vec<RetrievalDocument>, GatewayError> {
        let columns = self.list_columns(datasource_id, None).await?;
        let mut by_table: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
        for col in columns {
            by_table.entry(col.table.clone()).or_default().push(col);
        }
        Ok(by_table
            .iter()
            .map(|(table, cols)| table_document(table, cols))
            .collect())
    }

    /// The document for a single table, or `None` if it has no columns.
    pub async fn schema_document_for_table(
        &self,
        datasource_id: &str,
        table: &str,
    ) -> Result<Option<RetrievalDocument>, GatewayError> {
        if !is_valid_identifier(table) {
            return Err(GatewayError::Validation(format!(
                "Invalid table name: {table:?}"
            )));
        }
        let columns = self.list_columns(datasource_id, Some(table)).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(table_document(table, &columns)))
    }

    /// First rows of an existing table; `limit` is clamped to 1..=100.
    pub async fn preview_table(
        &self,
        datasource_id: &str,
        table: &str,
        limit: usize,
    ) -> Result<QueryResult, GatewayError> {
        let quoted = quote_identifier(table)?;
        let limit = limit.clamp(1, MAX_PREVIEW_ROWS);

        let names: Vec<String> = self
            .list_tables(datasource_id)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        if !names.iter().any(|n| n == table) {
            return Err(GatewayError::TableNotFound {
                table: table.to_string(),
                suggestion: find_closest_match(table, &names),
            });
        }

        self.execute(&QueryRequest {
            datasource_id: datasource_id.to_string(),
            sql: format!("SELECT * FROM {quoted} LIMIT {limit}"),
            max_rows: limit,
            timeout: self.settings.catalog_timeout,
        })
        .await
    }
}

/// `TABLE name:` followed by one line per column.
pub fn table_document(table: &str, columns: &[ColumnInfo]) -> RetrievalDocument {
    let mut lines = vec![format!("TABLE {table}:")];
    for c in columns {
        let mut extra = Vec::new();
        if !c.key.is_empty() {
            extra.push(format!("key={}", c.key));
        }
        extra.push(format!(
            "nullable={}",
            if c.nullable { "YES" } else { "NO" }
        ));
        if !c.comment.is_empty() {
            extra.push(format!("comment={}", c.comment));
        }
        lines.push(format!(
            "  - {} ({}) {}",
            c.column,
            c.column_type,
            extra.join(", ")
        ));
    }

    RetrievalDocument {
        id: table_doc_id(table),
        text: lines.join("\n"),
        metadata: BTreeMap::from([("table".to_string(), table.to_string())]),
    }
}
