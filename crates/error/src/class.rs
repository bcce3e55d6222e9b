//! Failure classes shared by every module error.
//!
//! The class, not the concrete error type, decides what happens next:
//! retry in place, ask the generator for a repaired statement, or stop.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Statement is not read-only or is otherwise malformed before it reaches a pool.
    Validation,
    /// Statement references tables outside the caller's allowlist.
    Authorization,
    /// Timeout, dropped connection, rate limiting or 5xx from an upstream.
    Transient,
    /// A breaker refused the call without attempting it.
    CircuitOpen,
    /// An upstream answered with a payload we cannot interpret.
    UpstreamShape,
    /// The database rejected the statement (syntax, unknown column, ...).
    Query,
    Internal,
}

impl ErrorClass {
    /// Whether the retry loop may attempt the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    /// Whether an execution failure of this class may be handed back to the
    /// SQL generator for a rewrite. Everything except a rejected table and
    /// an open breaker is.
    pub fn is_repairable(&self) -> bool {
        !matches!(self, ErrorClass::Authorization | ErrorClass::CircuitOpen)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Transient => "transient",
            ErrorClass::CircuitOpen => "circuit_open",
            ErrorClass::UpstreamShape => "upstream_shape",
            ErrorClass::Query => "query",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by module errors so callers can branch on the class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
