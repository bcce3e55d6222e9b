use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following ASKQL-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Connection / datasource errors
/// - **2000-2999**: Query errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Authorization errors
/// - **5000-5999**: Internal/System errors
/// - **6000-6999**: Upstream model service errors (chat, embeddings)
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Connection Errors (1000-1999) ===
    /// ASKQL-1001: Datasource id not configured
    DatasourceNotFound = 1001,
    /// ASKQL-1002: Connecting to the database timed out
    ConnectionTimeout = 1002,
    /// ASKQL-1003: Connection dropped or invalidated mid-call
    ConnectionLost = 1003,
    /// ASKQL-1004: Connection pool could not be built or is exhausted
    PoolExhausted = 1004,
    /// ASKQL-1005: Circuit breaker is open for the resource
    CircuitOpen = 1005,

    // === Query Errors (2000-2999) ===
    /// ASKQL-2001: Database rejected the statement
    QueryFailed = 2001,
    /// ASKQL-2002: Statement exceeded its time budget
    QueryTimeout = 2002,
    /// ASKQL-2003: Statement is not read-only
    ReadOnlyViolation = 2003,
    /// ASKQL-2004: Table does not exist in the datasource
    TableNotFound = 2004,
    /// ASKQL-2005: Empty statement or malformed identifier
    InvalidStatement = 2005,
    /// ASKQL-2006: Request fields are missing or inconsistent with each other
    InvalidRequest = 2006,

    // === Configuration Errors (3000-3999) ===
    /// ASKQL-3001: Configuration could not be loaded or validated
    InvalidConfig = 3001,
    /// ASKQL-3002: Required setting missing
    MissingRequiredField = 3002,

    // === Authorization Errors (4000-4999) ===
    /// ASKQL-4001: Caller identity missing
    AuthenticationFailed = 4001,
    /// ASKQL-4002: Statement references tables outside the caller's allowlist
    TableNotAllowed = 4002,
    /// ASKQL-4003: Caller does not own the referenced resource
    Forbidden = 4003,
    /// ASKQL-4004: Conversation, message or scope does not exist for the caller
    ResourceNotFound = 4004,

    // === Internal Errors (5000-5999) ===
    /// ASKQL-5001: Serialization/deserialization failed
    SerializationFailed = 5001,
    /// ASKQL-5002: Local persistence failed
    StorageFailed = 5002,
    /// ASKQL-5003: Unexpected internal state
    InternalPanic = 5003,

    // === Upstream Errors (6000-6999) ===
    /// ASKQL-6001: Model service unreachable or failing
    UpstreamUnavailable = 6001,
    /// ASKQL-6002: Model service rate limited the request
    UpstreamRateLimited = 6002,
    /// ASKQL-6003: Model service returned an unexpected payload
    UnexpectedUpstreamShape = 6003,
    /// ASKQL-6004: Model service is not configured
    UpstreamNotConfigured = 6004,

    /// ASKQL-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "ASKQL-2003")
    pub fn as_str(&self) -> String {
        format!("ASKQL-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Auth,
            6000..=6999 => ErrorCategory::Upstream,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("ASKQL-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::DatasourceNotFound),
            1002 => Ok(Self::ConnectionTimeout),
            1003 => Ok(Self::ConnectionLost),
            1004 => Ok(Self::PoolExhausted),
            1005 => Ok(Self::CircuitOpen),
            2001 => Ok(Self::QueryFailed),
            2002 => Ok(Self::QueryTimeout),
            2003 => Ok(Self::ReadOnlyViolation),
            2004 => Ok(Self::TableNotFound),
            2005 => Ok(Self::InvalidStatement),
            2006 => Ok(Self::InvalidRequest),
            3001 => Ok(Self::InvalidConfig),
            3002 => Ok(Self::MissingRequiredField),
            4001 => Ok(Self::AuthenticationFailed),
            4002 => Ok(Self::TableNotAllowed),
            4003 => Ok(Self::Forbidden),
            4004 => Ok(Self::ResourceNotFound),
            5001 => Ok(Self::SerializationFailed),
            5002 => Ok(Self::StorageFailed),
            5003 => Ok(Self::InternalPanic),
            6001 => Ok(Self::UpstreamUnavailable),
            6002 => Ok(Self::UpstreamRateLimited),
            6003 => Ok(Self::UnexpectedUpstreamShape),
            6004 => Ok(Self::UpstreamNotConfigured),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category, used for grouping in logs and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Connection,
    Query,
    Config,
    Auth,
    Internal,
    Upstream,
}
