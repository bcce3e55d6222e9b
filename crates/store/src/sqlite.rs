use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use askql_common::models::{
    AuditRecord, ChatTurn, MessageArtifact, Role, SchemaChangeRecord, SchemaSnapshot,
    StoredMessage, TableScope,
};
use askql_common::store::{AccessStore, AuditStore, ConversationStore, SnapshotStore};

use crate::error::StoreError;

const INITIAL_SCHEMA: &str = include_str!("../migrations/001_initial_schema.sql");

/// All ports over one SQLite connection. Every call runs on the blocking
/// pool while holding the connection lock.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating parent directories) and migrate.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Connection::open(&path)?)
        })
        .await??;
        let store = Self::from_connection(conn);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self::from_connection(Connection::open_in_memory()?);
        store.init().await?;
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Apply the schema; safe to run repeatedly.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(INITIAL_SCHEMA)?;
            debug!("store schema applied");
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut conn)
        })
        .await?
    }

    /// Record a table uploaded by `user` into `datasource_id`.
    pub async fn add_upload(
        &self,
        user: &str,
        datasource_id: &str,
        table: &str,
    ) -> Result<(), StoreError> {
        let (user, datasource_id, table) =
            (user.to_string(), datasource_id.to_string(), table.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO file_uploads (user_name, datasource_id, table_name, created_at)
                 VALUES (?, ?, ?, ?)",
                params![user, datasource_id, table, now()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn artifact(&self, message_id: i64) -> Result<Option<MessageArtifact>, StoreError> {
        let raw = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT sql_text, columns_json, rows_json, chart_json, analysis
                         FROM message_artifacts WHERE message_id = ?",
                        params![message_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, Option<String>>(3)?,
                                row.get::<_, String>(4)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;
        let Some((sql, columns, rows, chart, analysis)) = raw else {
            return Ok(None);
        };
        Ok(Some(MessageArtifact {
            sql,
            columns: serde_json::from_str(&columns)?,
            rows: serde_json::from_str(&rows)?,
            chart: chart.map(|c| serde_json::from_str(&c)).transpose()?,
            analysis,
        }))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("timestamp {raw:?}: {e}")))
}

fn parse_role(raw: &str) -> Result<Role, StoreError> {
    match raw {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(StoreError::Decode(format!("unknown role {other:?}"))),
    }
}

fn decode_list(raw: &str) -> Result<Vec<String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

const SCOPE_COLUMNS: &str = "id, user_name, datasource_id, name, tables_json, created_at";

struct RawScope {
    id: i64,
    user: String,
    datasource_id: String,
    name: String,
    tables: String,
    created_at: String,
}

fn scope_from_row(row: &Row<'_>) -> rusqlite::Result<RawScope> {
    Ok(RawScope {
        id: row.get("id")?,
        user: row.get("user_name")?,
        datasource_id: row.get("datasource_id")?,
        name: row.get("name")?,
        tables: row.get("tables_json")?,
        created_at: row.get("created_at")?,
    })
}

impl RawScope {
    fn decode(self) -> Result<TableScope, StoreError> {
        Ok(TableScope {
            id: self.id,
            user: self.user,
            datasource_id: self.datasource_id,
            name: self.name,
            tables: decode_list(&self.tables)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct RawAudit {
    record: AuditRecord,
    created_at: String,
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<RawAudit> {
    Ok(RawAudit {
        record: AuditRecord {
            user: row.get("user_name")?,
            conversation_id: row.get("conversation_id")?,
            message_id: row.get("message_id")?,
            datasource_id: row.get("datasource_id")?,
            sql_text: row.get("sql_text")?,
            row_count: row.get::<_, i64>("row_count")?.max(0) as usize,
            elapsed_ms: row.get::<_, i64>("elapsed_ms")?.max(0) as u64,
            success: row.get("success")?,
            error_message: row.get("error_message")?,
            slow: row.get("slow")?,
            created_at: Utc::now(),
        },
        created_at: row.get("created_at")?,
    })
}

impl ConversationStore for SqliteStore {
    fn ensure_conversation<'a>(
        &'a self,
        user: &'a str,
        conversation_id: Option<i64>,
        title: &'a str,
    ) -> BoxFuture<'a, Result<i64>> {
        let (user, title) = (user.to_string(), title.to_string());
        Box::pin(async move {
            let id = self
                .with_conn(move |conn| {
                    if let Some(id) = conversation_id {
                        let owned: Option<i64> = conn
                            .query_row(
                                "SELECT id FROM conversations WHERE id = ? AND user_name = ?",
                                params![id, user],
                                |row| row.get(0),
                            )
                            .optional()?;
                        if let Some(id) = owned {
                            return Ok(id);
                        }
                    }
                    let ts = now();
                    conn.execute(
                        "INSERT INTO conversations (user_name, title, created_at, updated_at)
                         VALUES (?, ?, ?, ?)",
                        params![user, title, ts, ts],
                    )?;
                    Ok(conn.last_insert_rowid())
                })
                .await?;
            Ok(id)
        })
    }

    fn add_message<'a>(
        &'a self,
        conversation_id: i64,
        role: Role,
        content: &'a str,
    ) -> BoxFuture<'a, Result<i64>> {
        let content = content.to_string();
        Box::pin(async move {
            let id = self
                .with_conn(move |conn| {
                    let tx = conn.transaction()?;
                    let ts = now();
                    tx.execute(
                        "INSERT INTO messages (conversation_id, role, content, created_at)
                         VALUES (?, ?, ?, ?)",
                        params![conversation_id, role.as_str(), content, ts],
                    )?;
                    let id = tx.last_insert_rowid();
                    tx.execute(
                        "UPDATE conversations SET updated_at = ? WHERE id = ?",
                        params![ts, conversation_id],
                    )?;
                    tx.commit()?;
                    Ok(id)
                })
                .await?;
            Ok(id)
        })
    }

    fn recent_turns(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatTurn>>> {
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT role, content FROM messages
                         WHERE conversation_id = ? ORDER BY id DESC LIMIT ?",
                    )?;
                    let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
                })
                .await?;
            let mut turns = raw
                .into_iter()
                .map(|(role, content)| {
                    Ok(ChatTurn {
                        role: parse_role(&role)?,
                        content,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            turns.reverse();
            Ok(turns)
        })
    }

    fn save_artifact<'a>(
        &'a self,
        message_id: i64,
        artifact: &'a MessageArtifact,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let columns = serde_json::to_string(&artifact.columns)?;
            let rows = serde_json::to_string(&artifact.rows)?;
            let chart = artifact
                .chart
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let (sql, analysis) = (artifact.sql.clone(), artifact.analysis.clone());
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO message_artifacts
                         (message_id, sql_text, columns_json, rows_json, chart_json, analysis, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (message_id) DO UPDATE SET
                         sql_text = excluded.sql_text, columns_json = excluded.columns_json,
                         rows_json = excluded.rows_json, chart_json = excluded.chart_json,
                         analysis = excluded.analysis",
                    params![message_id, sql, columns, rows, chart, analysis, now()],
                )?;
                Ok(())
            })
            .await?;
            Ok(())
        })
    }

    fn conversation_owner(&self, conversation_id: i64) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let owner = self
                .with_conn(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT user_name FROM conversations WHERE id = ?",
                            params![conversation_id],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await?;
            Ok(owner)
        })
    }

    fn message(&self, message_id: i64) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT id, conversation_id, role, content FROM messages WHERE id = ?",
                            params![message_id],
                            |row| {
                                Ok((
                                    row.get::<_, i64>(0)?,
                                    row.get::<_, i64>(1)?,
                                    row.get::<_, String>(2)?,
                                    row.get::<_, String>(3)?,
                                ))
                            },
                        )
                        .optional()?)
                })
                .await?;
            let Some((id, conversation_id, role, content)) = raw else {
                return Ok(None);
            };
            Ok(Some(StoredMessage {
                id,
                conversation_id,
                role: parse_role(&role)?,
                content,
            }))
        })
    }
}

impl AuditStore for SqliteStore {
    fn record_audit<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sql_audits (user_name, conversation_id, message_id, datasource_id,
                         sql_text, row_count, elapsed_ms, success, error_message, slow, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        record.user,
                        record.conversation_id,
                        record.message_id,
                        record.datasource_id,
                        record.sql_text,
                        record.row_count as i64,
                        record.elapsed_ms as i64,
                        record.success,
                        record.error_message,
                        record.slow,
                        record.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
            Ok(())
        })
    }

    fn list_audits<'a>(
        &'a self,
        user: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<AuditRecord>>> {
        let user = user.to_string();
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sql_audits WHERE user_name = ? ORDER BY id DESC LIMIT ?",
                    )?;
                    let rows = stmt.query_map(params![user, limit as i64], audit_from_row)?;
                    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
                })
                .await?;
            let records = raw
                .into_iter()
                .map(|r| {
                    Ok(AuditRecord {
                        created_at: parse_time(&r.created_at)?,
                        ..r.record
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(records)
        })
    }
}

impl AccessStore for SqliteStore {
    fn upload_tables<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        let (user, datasource_id) = (user.to_string(), datasource_id.to_string());
        Box::pin(async move {
            let tables = self
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT table_name FROM file_uploads
                         WHERE user_name = ? AND datasource_id = ? ORDER BY table_name",
                    )?;
                    let rows = stmt.query_map(params![user, datasource_id], |row| row.get(0))?;
                    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
                })
                .await?;
            Ok(tables)
        })
    }

    fn table_scope<'a>(
        &'a self,
        user: &'a str,
        scope_id: i64,
    ) -> BoxFuture<'a, Result<Option<TableScope>>> {
        let user = user.to_string();
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    let sql =
                        format!("SELECT {SCOPE_COLUMNS} FROM table_scopes WHERE id = ? AND user_name = ?");
                    Ok(conn
                        .query_row(&sql, params![scope_id, user], scope_from_row)
                        .optional()?)
                })
                .await?;
            Ok(raw.map(RawScope::decode).transpose()?)
        })
    }

    fn list_scopes<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TableScope>>> {
        let (user, datasource_id) = (user.to_string(), datasource_id.to_string());
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    let sql = format!(
                        "SELECT {SCOPE_COLUMNS} FROM table_scopes
                         WHERE user_name = ? AND datasource_id = ? ORDER BY id DESC"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![user, datasource_id], scope_from_row)?;
                    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
                })
                .await?;
            let scopes = raw
                .into_iter()
                .map(RawScope::decode)
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(scopes)
        })
    }

    fn create_scope<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
        name: &'a str,
        tables: &'a [String],
    ) -> BoxFuture<'a, Result<TableScope>> {
        Box::pin(async move {
            let tables_json = serde_json::to_string(tables)?;
            let created_at = Utc::now();
            let (owner, ds, label) =
                (user.to_string(), datasource_id.to_string(), name.to_string());
            let ts = created_at.to_rfc3339();
            let id = self
                .with_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO table_scopes (user_name, datasource_id, name, tables_json, created_at)
                         VALUES (?, ?, ?, ?, ?)",
                        params![owner, ds, label, tables_json, ts],
                    )?;
                    Ok(conn.last_insert_rowid())
                })
                .await?;
            Ok(TableScope {
                id,
                user: user.to_string(),
                datasource_id: datasource_id.to_string(),
                name: name.to_string(),
                tables: tables.to_vec(),
                created_at,
            })
        })
    }

    fn delete_scope<'a>(&'a self, user: &'a str, scope_id: i64) -> BoxFuture<'a, Result<bool>> {
        let user = user.to_string();
        Box::pin(async move {
            let deleted = self
                .with_conn(move |conn| {
                    Ok(conn.execute(
                        "DELETE FROM table_scopes WHERE id = ? AND user_name = ?",
                        params![scope_id, user],
                    )?)
                })
                .await?;
            Ok(deleted > 0)
        })
    }
}

impl SnapshotStore for SqliteStore {
    fn latest_snapshot<'a>(
        &'a self,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SchemaSnapshot>>> {
        let datasource_id = datasource_id.to_string();
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT datasource_id, schema_json, checked_at
                             FROM schema_snapshots WHERE datasource_id = ?",
                            params![datasource_id],
                            |row| {
                                Ok((
                                    row.get::<_, String>(0)?,
                                    row.get::<_, String>(1)?,
                                    row.get::<_, String>(2)?,
                                ))
                            },
                        )
                        .optional()?)
                })
                .await?;
            match raw {
                Some((datasource_id, schema_json, checked_at)) => Ok(Some(SchemaSnapshot {
                    datasource_id,
                    schema_json,
                    checked_at: parse_time(&checked_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn save_snapshot<'a>(&'a self, snapshot: &'a SchemaSnapshot) -> BoxFuture<'a, Result<()>> {
        let snapshot = snapshot.clone();
        Box::pin(async move {
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO schema_snapshots (datasource_id, schema_json, checked_at)
                     VALUES (?, ?, ?)
                     ON CONFLICT (datasource_id) DO UPDATE SET
                         schema_json = excluded.schema_json, checked_at = excluded.checked_at",
                    params![
                        snapshot.datasource_id,
                        snapshot.schema_json,
                        snapshot.checked_at.to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await?;
            Ok(())
        })
    }

    fn append_change<'a>(&'a self, record: &'a SchemaChangeRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let added = serde_json::to_string(&record.added)?;
            let removed = serde_json::to_string(&record.removed)?;
            let changed = serde_json::to_string(&record.changed)?;
            let datasource_id = record.datasource_id.clone();
            let created_at = record.created_at.to_rfc3339();
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO schema_change_log
                         (datasource_id, added_json, removed_json, changed_json, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                    params![datasource_id, added, removed, changed, created_at],
                )?;
                Ok(())
            })
            .await?;
            Ok(())
        })
    }

    fn list_changes<'a>(
        &'a self,
        datasource_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<SchemaChangeRecord>>> {
        let datasource_id = datasource_id.to_string();
        Box::pin(async move {
            let raw = self
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT datasource_id, added_json, removed_json, changed_json, created_at
                         FROM schema_change_log WHERE datasource_id = ?
                         ORDER BY id DESC LIMIT ?",
                    )?;
                    let rows = stmt.query_map(params![datasource_id, limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?;
                    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
                })
                .await?;
            let records = raw
                .into_iter()
                .map(|(datasource_id, added, removed, changed, created_at)| {
                    Ok(SchemaChangeRecord {
                        datasource_id,
                        added: decode_list(&added)?,
                        removed: decode_list(&removed)?,
                        changed: decode_list(&changed)?,
                        created_at: parse_time(&created_at)?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(records)
        })
    }
}
