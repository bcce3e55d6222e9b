//! # Error Contexts
//!
//! Structured metadata attached to errors so API clients can act on them
//! without parsing messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for ASKQL-4002 (TableNotAllowed)
    Allowlist {
        disallowed_tables: Vec<String>,
        referenced_tables: Vec<String>,
    },

    /// Context for ASKQL-2004 (TableNotFound)
    TableNotFound {
        table: String,
        datasource: Option<String>,
    },

    /// Context for connection errors (ASKQL-1001..1005)
    Datasource {
        datasource: String,
        host: Option<String>,
        port: Option<u16>,
    },

    /// Context for ASKQL-1005 when the open breaker guards a named resource
    Circuit { resource: String },

    /// Context for upstream model service errors (ASKQL-6xxx)
    Upstream {
        service: String,
        status: Option<u16>,
    },

    /// Context for ASKQL-3001/3002
    Config {
        file_path: Option<String>,
        field: Option<String>,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_context_serde_roundtrip() {
        let ctx = ErrorContext::Allowlist {
            disallowed_tables: vec!["salaries".to_string()],
            referenced_tables: vec!["orders".to_string(), "salaries".to_string()],
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"type\":\"allowlist\""));

        match serde_json::from_str::<ErrorContext>(&json).unwrap() {
            ErrorContext::Allowlist {
                disallowed_tables, ..
            } => assert_eq!(disallowed_tables, vec!["salaries".to_string()]),
            _ => panic!("Wrong variant"),
        }
    }
}
