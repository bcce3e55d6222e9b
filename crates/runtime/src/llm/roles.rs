//! The chat client in its three roles: SQL writer, analyst, assistant.
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{
    AnalysisInput, AnalysisStream, Analyst, GenerationRequest, SqlAssistant, SqlGenerator,
};

use super::{ChatMessage, ChatStream, LlmError, OpenAiChatClient};

/// Prior turns included in a generation prompt.
const HISTORY_TURNS: usize = 10;
/// Rows of the result the analyst is shown.
pub const ANALYSIS_ROW_LIMIT: usize = 50;
const HELPER_TEMPERATURE: f32 = 0.2;

pub const ANALYSIS_UNAVAILABLE: &str =
    "The analysis service is temporarily unavailable, please try again later.";

const SQL_RULES: &str = "You are an expert data analyst. Convert the user's question into a SINGLE MySQL query.
Rules:
- Only output SQL (no markdown, no explanations).
- Only SELECT/WITH queries. Never use INSERT/UPDATE/DELETE/DDL.
- Prefer explicit column names; avoid SELECT * unless necessary.
- Use LIMIT {max_rows} unless the user explicitly asks for all rows.
- If the question is ambiguous, make a reasonable assumption and still output SQL.";

const ANALYSIS_RULES: &str = "You are a data analyst. You receive the user's question, the SQL that was run and a sample of the result rows (possibly truncated).
Answer with:
1) Key findings (bullet points)
2) Definitions, data quality and limitations (bullet points)
3) Next steps (2-3 concrete follow-up queries)
Be concise and practical. Do not output code blocks.";

/// Strip whitespace, a surrounding ```` ``` ```` fence and wrapping backticks.
pub fn clean_sql(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (`sql`, `mysql`, ...) on the fence line.
        text = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        text = text.trim_end().trim_end_matches("```");
    }
    let text = text.trim();
    if text.starts_with('`') {
        text.trim_matches(|c: char| c == '`' || c.is_whitespace()).to_string()
    } else {
        text.to_string()
    }
}

pub struct LlmSqlGenerator {
    client: Arc<OpenAiChatClient>,
}

impl LlmSqlGenerator {
    pub fn new(client: Arc<OpenAiChatClient>) -> Self {
        Self { client }
    }

    fn messages(request: &GenerationRequest, question: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(
            SQL_RULES.replace("{max_rows}", &request.max_rows.to_string()),
        )];
        if request.table_lock && !request.allowed_tables.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Only these tables may be used: {}",
                request.allowed_tables.join(", ")
            )));
        }
        if !request.schema_context.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Relevant schema:\n{}",
                request.schema_context
            )));
        }
        let skip = request.history.len().saturating_sub(HISTORY_TURNS);
        messages.extend(
            request
                .history
                .iter()
                .skip(skip)
                .map(|turn| ChatMessage::new(turn.role.as_str(), turn.content.clone())),
        );
        messages.push(ChatMessage::user(question));
        messages
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let raw = self
            .client
            .chat(&Self::messages(request, &request.question), None)
            .await?;
        Ok(clean_sql(&raw))
    }

    async fn repair(
        &self,
        request: &GenerationRequest,
        failed_sql: &str,
        error: &str,
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "The SQL failed to run. Please rewrite a correct MySQL SELECT query. Only output SQL.\nQuestion: {}\nError: {error}\nSQL: {failed_sql}",
            request.question
        );
        let raw = self.client.chat(&Self::messages(request, &prompt), None).await?;
        Ok(clean_sql(&raw))
    }
}

/// Streams narration; falls back to one blocking call, then to
/// [`ANALYSIS_UNAVAILABLE`]. Never yields an error.
pub struct LlmAnalyst {
    client: Arc<OpenAiChatClient>,
}

impl LlmAnalyst {
    pub fn new(client: Arc<OpenAiChatClient>) -> Self {
        Self { client }
    }
}

fn analysis_messages(input: &AnalysisInput) -> Vec<ChatMessage> {
    let sample: Vec<_> = input.rows.iter().take(ANALYSIS_ROW_LIMIT).collect();
    let payload = json!({
        "question": input.question,
        "sql": input.sql,
        "columns": input.columns,
        "sample_rows": sample,
        "row_count_shown": input.row_count,
    });
    vec![
        ChatMessage::system(ANALYSIS_RULES),
        ChatMessage::user(payload.to_string()),
    ]
}

enum Phase {
    Start,
    Streaming { inner: ChatStream, yielded: bool },
    Finished,
}

struct AnalystState {
    client: Arc<OpenAiChatClient>,
    messages: Vec<ChatMessage>,
    phase: Phase,
}

async fn fallback(client: &OpenAiChatClient, messages: &[ChatMessage]) -> String {
    match client.chat(messages, Some(HELPER_TEMPERATURE)).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => ANALYSIS_UNAVAILABLE.to_string(),
        Err(e) => {
            warn!(error = %e, "analysis fallback failed");
            ANALYSIS_UNAVAILABLE.to_string()
        }
    }
}

async fn next_analysis_chunk(
    mut st: AnalystState,
) -> Option<(Result<String, LlmError>, AnalystState)> {
    loop {
        match std::mem::replace(&mut st.phase, Phase::Finished) {
            Phase::Start => {
                match st
                    .client
                    .chat_stream(&st.messages, Some(HELPER_TEMPERATURE))
                    .await
                {
                    Ok(inner) => {
                        st.phase = Phase::Streaming {
                            inner,
                            yielded: false,
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "analysis stream unavailable, falling back");
                        let text = fallback(&st.client, &st.messages).await;
                        return Some((Ok(text), st));
                    }
                }
            }
            Phase::Streaming { mut inner, yielded } => match inner.next().await {
                Some(Ok(delta)) => {
                    st.phase = Phase::Streaming {
                        inner,
                        yielded: true,
                    };
                    return Some((Ok(delta), st));
                }
                Some(Err(e)) if !yielded => {
                    debug!(error = %e, "analysis stream broke before output, falling back");
                    let text = fallback(&st.client, &st.messages).await;
                    return Some((Ok(text), st));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "analysis stream broke mid-way");
                    return None;
                }
                None => return None,
            },
            Phase::Finished => return None,
        }
    }
}

impl Analyst for LlmAnalyst {
    fn analyze(&self, input: AnalysisInput) -> AnalysisStream {
        let state = AnalystState {
            client: self.client.clone(),
            messages: analysis_messages(&input),
            phase: Phase::Start,
        };
        stream::unfold(state, next_analysis_chunk).boxed()
    }
}

pub struct LlmSqlAssistant {
    client: Arc<OpenAiChatClient>,
}

impl LlmSqlAssistant {
    pub fn new(client: Arc<OpenAiChatClient>) -> Self {
        Self { client }
    }

    async fn ask(&self, system: &str, user: String) -> String {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        match self.client.chat(&messages, Some(HELPER_TEMPERATURE)).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                debug!(error = %e, "assistant call failed");
                String::new()
            }
        }
    }
}

#[async_trait]
impl SqlAssistant for LlmSqlAssistant {
    async fn explain(&self, sql: &str) -> String {
        self.ask(
            "Explain the SQL concisely in 1-2 sentences. No markdown.",
            sql.to_string(),
        )
        .await
    }

    async fn suggest(&self, question: &str, sql: &str, row_count: usize, elapsed_ms: u64) -> String {
        self.ask(
            "Provide 2-3 actionable SQL improvement suggestions. Focus on filters, LIMIT, correctness and performance. No markdown.",
            format!("Question: {question}\nSQL: {sql}\nStats: row_count={row_count}, elapsed_ms={elapsed_ms}"),
        )
        .await
    }

    async fn fix(&self, sql: &str, error: &str) -> String {
        self.ask(
            "Fix the SQL error and return a short explanation plus corrected SQL. Format: suggestion: ...; fixed_sql: ... . No markdown.",
            format!("SQL: {sql}\nError: {error}"),
        )
        .await
    }
}
