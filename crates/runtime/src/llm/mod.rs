//! OpenAI-compatible HTTP clients.
//!
//! Each client owns its own circuit breaker (`llm_chat`, `llm_embed`) and
//! retry policy. Every public call is one guarded outer call: breaker check,
//! retry loop, one outcome report.
use askql_common::circuit_breaker::CircuitOpen;
use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode, ErrorContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod chat;
mod embedding;
mod roles;

pub use chat::{ChatStream, OpenAiChatClient};
pub use embedding::OpenAiEmbeddingClient;
pub use roles::{
    clean_sql, LlmAnalyst, LlmSqlAssistant, LlmSqlGenerator, ANALYSIS_UNAVAILABLE, ANALYSIS_ROW_LIMIT,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// Connect failures, timeouts and dropped bodies.
    #[error("{service} request failed: {message}")]
    Transport {
        service: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected {service} response: {detail}")]
    UnexpectedShape {
        service: &'static str,
        detail: String,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
}

impl LlmError {
    pub(crate) fn transport(service: &'static str, err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
        LlmError::Transport {
            service,
            message: err.to_string(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// 408, 429 and every 5xx may clear on their own.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl Classify for LlmError {
    fn class(&self) -> ErrorClass {
        match self {
            LlmError::NotConfigured(_) => ErrorClass::Internal,
            LlmError::Transport { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Internal
                }
            }
            LlmError::Status { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Internal
                }
            }
            LlmError::UnexpectedShape { .. } => ErrorClass::UpstreamShape,
            LlmError::CircuitOpen(_) => ErrorClass::CircuitOpen,
        }
    }
}

impl From<&LlmError> for AskqlError {
    fn from(err: &LlmError) -> Self {
        let message = err.to_string();
        let (code, service, status) = match err {
            LlmError::NotConfigured(service) => (ErrorCode::UpstreamNotConfigured, *service, None),
            LlmError::Transport { service, .. } => (ErrorCode::UpstreamUnavailable, *service, None),
            LlmError::Status {
                service, status, ..
            } if *status == 429 => (ErrorCode::UpstreamRateLimited, *service, Some(*status)),
            LlmError::Status {
                service, status, ..
            } => (ErrorCode::UpstreamUnavailable, *service, Some(*status)),
            LlmError::UnexpectedShape { service, .. } => {
                (ErrorCode::UnexpectedUpstreamShape, *service, None)
            }
            LlmError::CircuitOpen(open) => {
                return AskqlError::new(ErrorCode::CircuitOpen, message).with_context(
                    ErrorContext::Circuit {
                        resource: open.name.clone(),
                    },
                )
            }
        };
        AskqlError::new(code, message)
            .with_class(err.class())
            .with_context(ErrorContext::Upstream {
                service: service.to_string(),
                status,
            })
    }
}

impl From<LlmError> for AskqlError {
    fn from(err: LlmError) -> Self {
        AskqlError::from(&err)
    }
}
