use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{RetrievalDocument, SearchHit};

/// Similarity index over schema documents for one datasource.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    /// Up to `k` hits, nearest first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;

    /// Insert or replace documents by id.
    async fn upsert(&self, docs: Vec<RetrievalDocument>) -> Result<()>;

    /// Remove documents by id; unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

/// Hands out the index for a datasource, creating it on first use.
pub trait IndexCatalog: Send + Sync {
    fn index_for(&self, datasource_id: &str) -> Arc<dyn RetrievalIndex>;
}

/// Retrieval document id for a table.
pub fn table_doc_id(table: &str) -> String {
    format!("table::{table}")
}
