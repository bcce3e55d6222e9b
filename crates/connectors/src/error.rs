use askql_common::circuit_breaker::CircuitOpen;
use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode, ErrorContext};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown datasource: {0}")]
    UnknownDatasource(String),

    #[error("Table not found: {table}")]
    TableNotFound {
        table: String,
        suggestion: Option<String>,
    },

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// Dropped or refused connection, pool exhaustion, server going away.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected the statement. `retryable` covers lock waits,
    /// deadlocks and similar conditions that may clear on their own.
    #[error("Database error{}: {}", .code.map(|c| format!(" {c}")).unwrap_or_default(), .message)]
    Database {
        code: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error("Internal gateway error: {0}")]
    Internal(String),
}

impl Classify for GatewayError {
    fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Validation(_) => ErrorClass::Validation,
            GatewayError::UnknownDatasource(_) => ErrorClass::Validation,
            GatewayError::TableNotFound { .. } => ErrorClass::Query,
            GatewayError::Timeout(_) | GatewayError::Connection(_) => ErrorClass::Transient,
            GatewayError::Database { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Query
                }
            }
            GatewayError::CircuitOpen(_) => ErrorClass::CircuitOpen,
            GatewayError::Internal(_) => ErrorClass::Internal,
        }
    }
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn to_askql_error(&self) -> AskqlError {
        let message = self.to_string();
        match self {
            GatewayError::Validation(_) => AskqlError::new(ErrorCode::ReadOnlyViolation, message)
                .with_hint("Only a single SELECT or WITH statement can be executed"),
            GatewayError::UnknownDatasource(id) => {
                AskqlError::new(ErrorCode::DatasourceNotFound, message).with_context(
                    ErrorContext::Datasource {
                        datasource: id.clone(),
                        host: None,
                        port: None,
                    },
                )
                .with_class(ErrorClass::Validation)
            }
            GatewayError::TableNotFound { table, suggestion } => {
                let err = AskqlError::new(ErrorCode::TableNotFound, message).with_context(
                    ErrorContext::TableNotFound {
                        table: table.clone(),
                        datasource: None,
                    },
                );
                match suggestion {
                    Some(s) => err.with_hint(format!("Did you mean '{s}'?")),
                    None => err,
                }
            }
            GatewayError::Timeout(_) => AskqlError::new(ErrorCode::QueryTimeout, message)
                .with_hint("Narrow the filter or add a LIMIT"),
            GatewayError::Connection(_) => AskqlError::new(ErrorCode::ConnectionLost, message),
            GatewayError::Database { .. } => {
                AskqlError::new(ErrorCode::QueryFailed, message).with_class(self.class())
            }
            GatewayError::CircuitOpen(open) => AskqlError::new(ErrorCode::CircuitOpen, message)
                .with_context(ErrorContext::Circuit {
                    resource: open.name.clone(),
                })
                .with_hint("The database is temporarily unavailable; try again shortly"),
            GatewayError::Internal(_) => AskqlError::new(ErrorCode::InternalPanic, message),
        }
    }
}

impl From<GatewayError> for AskqlError {
    fn from(err: GatewayError) -> Self {
        err.to_askql_error()
    }
}
