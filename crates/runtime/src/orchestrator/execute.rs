//! Synchronous execution of caller-written SQL.
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use askql_common::models::{AuditRecord, MessageArtifact, QueryRequest, Role, StoredMessage};
use askql_connectors::GatewayError;
use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode};

use crate::authorizer::{AllowlistResolver, AuthorizationError};
use crate::collaborators::AnalysisInput;
use crate::llm::ANALYSIS_ROW_LIMIT;
use crate::safety::{safety_tips, SafetyInput};

use super::{best_effort, Orchestrator};

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub user: String,
    pub datasource_id: String,
    pub sql: String,
    pub conversation_id: Option<i64>,
    /// User message the artifact is stored against, if any. Must belong to
    /// `conversation_id`, which must belong to `user`.
    pub message_id: Option<i64>,
    /// Question shown to the analyst; defaults to the message text, then
    /// to the SQL itself.
    pub question: Option<String>,
    pub scope_id: Option<i64>,
    /// Run the analyst over the result.
    pub analyze: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecuteResponse {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub chart: Option<Value>,
    pub analysis: Option<String>,
    pub elapsed_ms: u64,
    pub slow: bool,
    pub explain: Option<String>,
    pub suggest: Option<String>,
    pub safety: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    #[error("SQL must not be empty")]
    EmptySql,

    #[error("message_id requires a conversation_id")]
    MissingConversation,

    #[error("Conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("Conversation {0} belongs to another user")]
    Forbidden(i64),

    #[error("Message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound { conversation_id: i64, message_id: i64 },

    #[error("Only user messages can be re-run")]
    NotUserMessage,

    #[error("Conversation lookup failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl Classify for ExecuteError {
    fn class(&self) -> ErrorClass {
        match self {
            ExecuteError::EmptySql
            | ExecuteError::MissingConversation
            | ExecuteError::NotUserMessage => ErrorClass::Validation,
            ExecuteError::ConversationNotFound(_)
            | ExecuteError::Forbidden(_)
            | ExecuteError::MessageNotFound { .. } => ErrorClass::Authorization,
            ExecuteError::Storage(_) => ErrorClass::Internal,
            ExecuteError::Authorization(e) => e.class(),
            ExecuteError::Gateway(e) => e.class(),
        }
    }
}

impl From<ExecuteError> for AskqlError {
    fn from(err: ExecuteError) -> Self {
        match err {
            ExecuteError::EmptySql => GatewayError::Validation(err.to_string()).to_askql_error(),
            ExecuteError::Authorization(e) => e.into(),
            ExecuteError::Gateway(e) => e.into(),
            other => {
                let code = match &other {
                    ExecuteError::MissingConversation | ExecuteError::NotUserMessage => {
                        ErrorCode::InvalidRequest
                    }
                    ExecuteError::ConversationNotFound(_) | ExecuteError::MessageNotFound { .. } => {
                        ErrorCode::ResourceNotFound
                    }
                    ExecuteError::Forbidden(_) => ErrorCode::Forbidden,
                    _ => ErrorCode::StorageFailed,
                };
                let class = other.class();
                AskqlError::new(code, other.to_string()).with_class(class)
            }
        }
    }
}

impl Orchestrator {
    /// Authorize and run `request.sql`, then post-process the result the
    /// way a chat session does. One audit record is written either way.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, ExecuteError> {
        let sql = request.sql.trim().to_string();
        if sql.is_empty() {
            return Err(ExecuteError::EmptySql);
        }
        let message = self.owned_message(&request).await?;
        let question = request
            .question
            .clone()
            .or_else(|| message.map(|m| m.content));
        let limits = &self.settings.limits;

        let allowed = AllowlistResolver::new(&self.gateway, self.stores.access.as_ref())
            .resolve(&request.user, &request.datasource_id, request.scope_id)
            .await?;
        if let Err(e) = allowed.authorize(&sql) {
            warn!(user = %request.user, disallowed = ?e.disallowed, "statement rejected by allowlist");
            return Err(e.into());
        }

        let query = QueryRequest {
            datasource_id: request.datasource_id.clone(),
            sql: sql.clone(),
            max_rows: limits.max_rows,
            timeout: Duration::from_secs(limits.query_timeout_secs),
        };
        let started = tokio::time::Instant::now();
        let outcome = self.gateway.execute(&query).await;

        let mut audit = AuditRecord {
            user: request.user.clone(),
            conversation_id: request.conversation_id,
            message_id: request.message_id,
            datasource_id: request.datasource_id.clone(),
            sql_text: sql.clone(),
            row_count: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success: false,
            error_message: None,
            slow: false,
            created_at: Utc::now(),
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                audit.error_message = Some(e.to_string());
                self.record_attempt(audit).await;
                return Err(e.into());
            }
        };
        let slow = result.elapsed_ms >= limits.slow_query_threshold_ms;
        let capped = result.row_count() >= limits.max_rows;
        audit.success = true;
        audit.row_count = result.row_count();
        audit.elapsed_ms = result.elapsed_ms;
        audit.slow = slow;
        self.record_attempt(audit).await;

        self.masker.mask_rows(&result.columns, &mut result.rows);
        let chart = self.collaborators.charts.suggest(&result.columns, &result.rows);

        let analysis = if request.analyze {
            let input = AnalysisInput {
                question: question.clone().unwrap_or_else(|| sql.clone()),
                sql: sql.clone(),
                columns: result.columns.clone(),
                rows: result.rows.iter().take(ANALYSIS_ROW_LIMIT).cloned().collect(),
                row_count: result.row_count(),
            };
            let mut chunks = self.collaborators.analyst.analyze(input);
            let mut text = String::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(delta) => text.push_str(&delta),
                    Err(e) => {
                        debug!(error = %e, "analysis stopped early");
                        break;
                    }
                }
            }
            Some(text.trim().to_string())
        } else {
            None
        };

        let explain = match self.assistant_for(self.settings.assistant.explain) {
            Some(assistant) => non_empty(assistant.explain(&sql).await),
            None => None,
        };
        let suggest = match self.assistant_for(self.settings.assistant.suggest) {
            Some(assistant) if slow || capped => {
                let question = question.as_deref().unwrap_or_default();
                non_empty(
                    assistant
                        .suggest(question, &sql, result.row_count(), result.elapsed_ms)
                        .await,
                )
            }
            _ => None,
        };

        let safety = safety_tips(&SafetyInput {
            sql: &sql,
            row_count: Some(result.row_count()),
            elapsed_ms: Some(result.elapsed_ms),
            max_rows: limits.max_rows,
            slow_threshold_ms: limits.slow_query_threshold_ms,
        });

        if let Some(message_id) = request.message_id {
            let artifact = MessageArtifact {
                sql: sql.clone(),
                columns: result.columns.clone(),
                rows: result.rows.clone(),
                chart: chart.clone(),
                analysis: analysis.clone().unwrap_or_default(),
            };
            best_effort(
                "artifact write",
                self.stores.conversations.save_artifact(message_id, &artifact),
            )
            .await;
        }

        let row_count = result.row_count();
        Ok(ExecuteResponse {
            sql,
            columns: result.columns,
            rows: result.rows,
            row_count,
            chart,
            analysis,
            elapsed_ms: result.elapsed_ms,
            slow,
            explain,
            suggest,
            safety,
        })
    }
}

impl Orchestrator {
    /// Checks that `request.conversation_id` belongs to the caller and that
    /// `request.message_id` is a user message inside it. Returns that
    /// message when one was named.
    async fn owned_message(
        &self,
        request: &ExecuteRequest,
    ) -> Result<Option<StoredMessage>, ExecuteError> {
        let Some(conversation_id) = request.conversation_id else {
            return match request.message_id {
                Some(_) => Err(ExecuteError::MissingConversation),
                None => Ok(None),
            };
        };
        let conversations = &self.stores.conversations;
        let owner = conversations
            .conversation_owner(conversation_id)
            .await
            .map_err(|e| ExecuteError::Storage(format!("{e:#}")))?;
        match owner {
            None => return Err(ExecuteError::ConversationNotFound(conversation_id)),
            Some(owner) if owner != request.user => {
                warn!(user = %request.user, conversation_id, "execute against a foreign conversation");
                return Err(ExecuteError::Forbidden(conversation_id));
            }
            Some(_) => {}
        }

        let Some(message_id) = request.message_id else {
            return Ok(None);
        };
        let message = conversations
            .message(message_id)
            .await
            .map_err(|e| ExecuteError::Storage(format!("{e:#}")))?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(ExecuteError::MessageNotFound {
                conversation_id,
                message_id,
            })?;
        if message.role != Role::User {
            return Err(ExecuteError::NotUserMessage);
        }
        Ok(Some(message))
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}
