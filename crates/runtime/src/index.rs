//! In-process retrieval index over schema documents.
//!
//! With an embedder configured, documents and queries are embedded and
//! ranked by cosine distance. Without one, or when the query cannot be
//! embedded, ranking falls back to token overlap.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use askql_common::index::{IndexCatalog, RetrievalIndex};
use askql_common::models::{RetrievalDocument, SearchHit};

use crate::llm::{LlmError, OpenAiEmbeddingClient};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

#[async_trait]
impl Embedder for OpenAiEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        OpenAiEmbeddingClient::embed(self, texts).await
    }
}

struct Entry {
    doc: RetrievalDocument,
    vector: Option<Vec<f32>>,
}

pub struct MemoryIndex {
    embedder: Option<Arc<dyn Embedder>>,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryIndex {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    async fn query_vector(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(e) => {
                warn!(error = %e, "query embedding failed; ranking by token overlap");
                None
            }
        }
    }
}

#[async_trait]
impl RetrievalIndex for MemoryIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let query_vector = self.query_vector(query).await;
        let query_tokens = tokens(query);
        let entries = self.entries.read().await;

        let mut hits: Vec<SearchHit> = entries
            .values()
            .map(|entry| {
                let distance = match (&query_vector, &entry.vector) {
                    (Some(q), Some(d)) => cosine_distance(q, d),
                    _ => overlap_distance(&query_tokens, &entry.doc.text),
                };
                SearchHit {
                    id: entry.doc.id.clone(),
                    text: entry.doc.text.clone(),
                    metadata: entry.doc.metadata.clone(),
                    distance,
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, docs: Vec<RetrievalDocument>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let vectors: Vec<Option<Vec<f32>>> = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
                embedder
                    .embed(&texts)
                    .await
                    .context("embedding schema documents")?
                    .into_iter()
                    .map(Some)
                    .collect()
            }
            None => vec![None; docs.len()],
        };

        let mut entries = self.entries.write().await;
        for (doc, vector) in docs.into_iter().zip(vectors) {
            entries.insert(doc.id.clone(), Entry { doc, vector });
        }
        debug!(documents = entries.len(), "index updated");
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// `1 - |q ∩ d| / |q|`; 1.0 for an empty query.
fn overlap_distance(query: &BTreeSet<String>, text: &str) -> f32 {
    if query.is_empty() {
        return 1.0;
    }
    let doc = tokens(text);
    let shared = query.intersection(&doc).count();
    1.0 - shared as f32 / query.len() as f32
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// One [`MemoryIndex`] per datasource, created on first request.
pub struct MemoryIndexCatalog {
    embedder: Option<Arc<dyn Embedder>>,
    indexes: Mutex<HashMap<String, Arc<MemoryIndex>>>,
}

impl MemoryIndexCatalog {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            embedder,
            indexes: Mutex::new(HashMap::new()),
        }
    }
}

impl IndexCatalog for MemoryIndexCatalog {
    fn index_for(&self, datasource_id: &str) -> Arc<dyn RetrievalIndex> {
        let mut indexes = self
            .indexes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        indexes
            .entry(datasource_id.to_string())
            .or_insert_with(|| Arc::new(MemoryIndex::new(self.embedder.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn doc(id: &str, text: &str) -> RetrievalDocument {
        RetrievalDocument {
            id: id.to_string(),
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Two-dimensional embedding: (mentions orders, mentions customers).
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.contains("order") as u8 as f32,
                        t.contains("customer") as u8 as f32,
                    ]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_token_overlap_ranking() {
        let index = MemoryIndex::new(None);
        index
            .upsert(vec![
                doc("table::orders", "TABLE orders:\n  - total (decimal)"),
                doc("table::customers", "TABLE customers:\n  - name (varchar)"),
            ])
            .await
            .unwrap();

        let hits = index.search("customers name", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "table::customers");
        assert_eq!(hits[0].distance, 0.0);
    }

    #[tokio::test]
    async fn test_cosine_ranking_with_embedder() {
        let index = MemoryIndex::new(Some(Arc::new(KeywordEmbedder)));
        index
            .upsert(vec![
                doc("table::orders", "orders"),
                doc("table::customers", "customers"),
            ])
            .await
            .unwrap();

        let hits = index.search("how many orders last week", 2).await.unwrap();
        assert_eq!(hits[0].id, "table::orders");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let index = MemoryIndex::new(None);
        index
            .upsert(vec![doc("a", "alpha"), doc("b", "beta")])
            .await
            .unwrap();
        index.delete(&["a".to_string(), "zzz".to_string()]).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        index.clear().await.unwrap();
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[test]
    fn test_catalog_reuses_index() {
        let catalog = MemoryIndexCatalog::new(None);
        let a = catalog.index_for("shop");
        let b = catalog.index_for("shop");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &catalog.index_for("crm")));
    }
}
