//! Seams between the orchestrator and the services it drives.
//!
//! The LLM-backed implementations live in [`crate::llm`]; tests plug in
//! scripted ones.
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use askql_common::models::ChatTurn;

use crate::llm::LlmError;

/// Everything the generator sees for one attempt.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub question: String,
    pub schema_context: String,
    /// Oldest first.
    pub history: Vec<ChatTurn>,
    /// Sorted.
    pub allowed_tables: Vec<String>,
    /// Tell the generator to stay inside `allowed_tables`.
    pub table_lock: bool,
    pub max_rows: usize,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;

    /// Rewrite `failed_sql` given the error it produced.
    async fn repair(
        &self,
        request: &GenerationRequest,
        failed_sql: &str,
        error: &str,
    ) -> Result<String, LlmError>;
}

/// What the analyst is shown; `rows` is already cut to a sample.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub question: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

pub type AnalysisStream = BoxStream<'static, Result<String, LlmError>>;

pub trait Analyst: Send + Sync {
    /// Lazily streamed narration chunks.
    fn analyze(&self, input: AnalysisInput) -> AnalysisStream;
}

/// Optional helper texts. Failures come back as empty strings.
#[async_trait]
pub trait SqlAssistant: Send + Sync {
    async fn explain(&self, sql: &str) -> String;

    async fn suggest(&self, question: &str, sql: &str, row_count: usize, elapsed_ms: u64) -> String;

    async fn fix(&self, sql: &str, error: &str) -> String;
}

pub trait ChartAdvisor: Send + Sync {
    /// An ECharts option for the result, if one fits.
    fn suggest(&self, columns: &[String], rows: &[Vec<Value>]) -> Option<Value>;
}
