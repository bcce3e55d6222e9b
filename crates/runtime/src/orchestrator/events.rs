use serde::Serialize;
use serde_json::Value;

use askql_error::ErrorClass;

/// Progress markers carried by `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SchemaRetrieval,
    SqlGeneration,
    SqlExecution,
    SqlRepair,
    ChartGeneration,
    AnalysisGeneration,
}

/// The stage an `error` event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSite {
    SchemaRetrieval,
    LlmSql,
    SchemaTables,
    SqlAllowlist,
    SqlExecution,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SlowQuery,
    RowCap,
}

/// One step of a chat session as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Message {
        user_message_id: Option<i64>,
    },
    Status {
        stage: Stage,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
    },
    Sql {
        sql: String,
        /// `retry_rewrite` on statements produced by a repair.
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    SqlExplain {
        sql: String,
        explain: String,
    },
    Error {
        message: String,
        #[serde(rename = "where")]
        site: ErrorSite,
        class: ErrorClass,
        #[serde(skip_serializing_if = "Option::is_none")]
        tables: Option<Vec<String>>,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        row_count: usize,
    },
    Warning {
        kind: WarningKind,
        message: String,
    },
    Chart {
        echarts_option: Option<Value>,
    },
    AnalysisDelta {
        delta: String,
    },
    Analysis {
        text: String,
        done: bool,
    },
    SqlFix {
        sql: String,
        fix: String,
    },
    SqlSuggest {
        sql: String,
        suggest: String,
    },
    Done {
        ok: bool,
    },
}

impl Event {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Message { .. } => "message",
            Event::Status { .. } => "status",
            Event::Sql { .. } => "sql",
            Event::SqlExplain { .. } => "sql_explain",
            Event::Error { .. } => "error",
            Event::Table { .. } => "table",
            Event::Warning { .. } => "warning",
            Event::Chart { .. } => "chart",
            Event::AnalysisDelta { .. } | Event::Analysis { .. } => "analysis",
            Event::SqlFix { .. } => "sql_fix",
            Event::SqlSuggest { .. } => "sql_suggest",
            Event::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done { .. })
    }
}

/// An event stamped with the session's request id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub request_id: String,
    pub event: Event,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        self.event.name()
    }

    /// JSON body with `request_id` merged into the event's fields.
    pub fn payload(&self) -> Value {
        let mut value = serde_json::to_value(&self.event).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Value::Object(map) = &mut value {
            map.insert("request_id".to_string(), Value::String(self.request_id.clone()));
        }
        value
    }
}
