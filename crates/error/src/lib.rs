//! # askql-error
//!
//! Unified error types for the askql query pipeline.
//!
//! Every error leaving a crate boundary carries:
//! - a stable numeric code (ASKQL-XXXX)
//! - optional structured context
//! - an optional hint the caller (or the SQL generator) can act on
//!
//! Module-level errors stay as `thiserror` enums and report an
//! [`ErrorClass`] so the orchestrator can decide between retry, repair
//! and abort without matching on concrete types.

mod class;
mod code;
mod context;
mod convert;

pub use class::{Classify, ErrorClass};
pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::find_closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type returned by askql APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskqlError {
    /// Numeric error code (e.g., "ASKQL-4002")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Failure class driving retry/repair decisions
    pub class: ErrorClass,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Actionable suggestion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl AskqlError {
    /// Create a new error; the class defaults from the code range.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            class: default_class(code),
            context: None,
            hint: None,
        }
    }

    /// Override the failure class
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = class;
        self
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize AskqlError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

fn default_class(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::ConnectionTimeout
        | ErrorCode::ConnectionLost
        | ErrorCode::PoolExhausted
        | ErrorCode::QueryTimeout
        | ErrorCode::UpstreamUnavailable
        | ErrorCode::UpstreamRateLimited => ErrorClass::Transient,
        ErrorCode::CircuitOpen => ErrorClass::CircuitOpen,
        ErrorCode::ReadOnlyViolation | ErrorCode::InvalidStatement | ErrorCode::InvalidRequest => {
            ErrorClass::Validation
        }
        ErrorCode::TableNotAllowed
        | ErrorCode::Forbidden
        | ErrorCode::ResourceNotFound
        | ErrorCode::AuthenticationFailed => ErrorClass::Authorization,
        ErrorCode::QueryFailed | ErrorCode::TableNotFound => ErrorClass::Query,
        ErrorCode::UnexpectedUpstreamShape => ErrorClass::UpstreamShape,
        _ => ErrorClass::Internal,
    }
}

impl Classify for AskqlError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

impl fmt::Display for AskqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for AskqlError {}

/// Result type alias for askql operations
pub type Result<T> = std::result::Result<T, AskqlError>;
