use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

// Secrets are written out redacted and read back as plain strings.
fn serialize_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(_) => serializer.serialize_str("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    Ok(s.map(SecretString::from))
}

fn default_mysql_port() -> u16 {
    3306
}

/// A named MySQL connection profile.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
pub struct DatasourceConfig {
    #[validate(length(min = 1))]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    #[validate(length(min = 1))]
    pub database: String,

    pub user: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub password: Option<SecretString>,

    #[serde(default)]
    pub is_default: bool,
}

/// Public view of a datasource, safe to return over the API.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatasourceSummary {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub is_default: bool,
}

impl From<&DatasourceConfig> for DatasourceSummary {
    fn from(ds: &DatasourceConfig) -> Self {
        Self {
            id: ds.id.clone(),
            name: ds.name.clone(),
            host: ds.host.clone(),
            port: ds.port,
            database: ds.database.clone(),
            is_default: ds.is_default,
        }
    }
}

/// A read-only statement bound for one datasource.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub datasource_id: String,
    pub sql: String,
    pub max_rows: usize,
    pub timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub elapsed_ms: u64,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    /// `BASE TABLE` or `VIEW`
    pub table_type: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ColumnInfo {
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub column_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub comment: String,
}

/// One entry of a retrieval index.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetrievalDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub distance: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SchemaSnapshot {
    pub datasource_id: String,
    /// Canonical JSON of `{table: {comment, type, columns}}`.
    pub schema_json: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SchemaChangeRecord {
    pub datasource_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One row per execution attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditRecord {
    pub user: String,
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub datasource_id: String,
    pub sql_text: String,
    pub row_count: usize,
    pub elapsed_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub slow: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// A message looked up by id, with the conversation it belongs to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
}

/// Result payload stored against the user message that asked for it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct MessageArtifact {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub chart: Option<serde_json::Value>,
    pub analysis: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableScope {
    pub id: i64,
    pub user: String,
    pub datasource_id: String,
    pub name: String,
    pub tables: Vec<String>,
    pub created_at: DateTime<Utc>,
}
