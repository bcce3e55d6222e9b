//! Persistence ports.
//!
//! The orchestrator and drift monitor only see these traits; the SQLite
//! implementation lives in `askql-store`. [`MemoryStore`] backs tests and
//! store-less deployments.
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::models::{
    AuditRecord, ChatTurn, MessageArtifact, Role, SchemaChangeRecord, SchemaSnapshot,
    StoredMessage, TableScope,
};

pub trait ConversationStore: Send + Sync {
    /// Return `conversation_id` if it exists for `user`, otherwise create a
    /// new conversation titled from the question.
    fn ensure_conversation<'a>(
        &'a self,
        user: &'a str,
        conversation_id: Option<i64>,
        title: &'a str,
    ) -> BoxFuture<'a, Result<i64>>;

    fn add_message<'a>(
        &'a self,
        conversation_id: i64,
        role: Role,
        content: &'a str,
    ) -> BoxFuture<'a, Result<i64>>;

    /// Most recent turns, oldest first.
    fn recent_turns(&self, conversation_id: i64, limit: usize)
        -> BoxFuture<'_, Result<Vec<ChatTurn>>>;

    fn save_artifact<'a>(
        &'a self,
        message_id: i64,
        artifact: &'a MessageArtifact,
    ) -> BoxFuture<'a, Result<()>>;

    /// The user who owns `conversation_id`, or `None` if it does not exist.
    fn conversation_owner(&self, conversation_id: i64) -> BoxFuture<'_, Result<Option<String>>>;

    fn message(&self, message_id: i64) -> BoxFuture<'_, Result<Option<StoredMessage>>>;
}

pub trait AuditStore: Send + Sync {
    fn record_audit<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<()>>;

    /// `user`'s records, newest first.
    fn list_audits<'a>(&'a self, user: &'a str, limit: usize)
        -> BoxFuture<'a, Result<Vec<AuditRecord>>>;
}

/// Caller-owned table visibility: uploaded tables and saved scopes.
pub trait AccessStore: Send + Sync {
    fn upload_tables<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>>;

    fn table_scope<'a>(&'a self, user: &'a str, scope_id: i64)
        -> BoxFuture<'a, Result<Option<TableScope>>>;

    /// `user`'s scopes on `datasource_id`, newest first.
    fn list_scopes<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TableScope>>>;

    fn create_scope<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
        name: &'a str,
        tables: &'a [String],
    ) -> BoxFuture<'a, Result<TableScope>>;

    /// `false` when `user` has no scope with that id.
    fn delete_scope<'a>(&'a self, user: &'a str, scope_id: i64) -> BoxFuture<'a, Result<bool>>;
}

pub trait SnapshotStore: Send + Sync {
    fn latest_snapshot<'a>(
        &'a self,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SchemaSnapshot>>>;

    /// Replaces any previous snapshot for the same datasource.
    fn save_snapshot<'a>(&'a self, snapshot: &'a SchemaSnapshot) -> BoxFuture<'a, Result<()>>;

    fn append_change<'a>(&'a self, record: &'a SchemaChangeRecord) -> BoxFuture<'a, Result<()>>;

    /// Newest first.
    fn list_changes<'a>(
        &'a self,
        datasource_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<SchemaChangeRecord>>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<i64, String>,
    messages: Vec<(i64, i64, ChatTurn)>,
    artifacts: HashMap<i64, MessageArtifact>,
    audits: Vec<AuditRecord>,
    uploads: Vec<(String, String, String)>,
    scopes: Vec<TableScope>,
    snapshots: HashMap<String, SchemaSnapshot>,
    changes: Vec<SchemaChangeRecord>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local implementation of every port.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        f(&mut state)
    }

    pub fn add_upload(&self, user: &str, datasource_id: &str, table: &str) -> Result<()> {
        self.with(|s| {
            s.uploads
                .push((user.to_string(), datasource_id.to_string(), table.to_string()));
            Ok(())
        })
    }

    pub fn add_scope(
        &self,
        user: &str,
        datasource_id: &str,
        name: &str,
        tables: Vec<String>,
    ) -> Result<i64> {
        self.with(|s| {
            let id = s.next_id();
            s.scopes.push(TableScope {
                id,
                user: user.to_string(),
                datasource_id: datasource_id.to_string(),
                name: name.to_string(),
                tables,
                created_at: Utc::now(),
            });
            Ok(id)
        })
    }

    pub fn artifact(&self, message_id: i64) -> Result<Option<MessageArtifact>> {
        self.with(|s| Ok(s.artifacts.get(&message_id).cloned()))
    }

    pub fn audits(&self) -> Result<Vec<AuditRecord>> {
        self.with(|s| Ok(s.audits.clone()))
    }

    pub fn messages(&self, conversation_id: i64) -> Result<Vec<ChatTurn>> {
        self.with(|s| {
            Ok(s.messages
                .iter()
                .filter(|(c, _, _)| *c == conversation_id)
                .map(|(_, _, t)| t.clone())
                .collect())
        })
    }
}

impl ConversationStore for MemoryStore {
    fn ensure_conversation<'a>(
        &'a self,
        user: &'a str,
        conversation_id: Option<i64>,
        _title: &'a str,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            self.with(|s| {
                if let Some(id) = conversation_id {
                    if s.conversations.get(&id).map(String::as_str) == Some(user) {
                        return Ok(id);
                    }
                }
                let id = s.next_id();
                s.conversations.insert(id, user.to_string());
                Ok(id)
            })
        })
    }

    fn add_message<'a>(
        &'a self,
        conversation_id: i64,
        role: Role,
        content: &'a str,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            self.with(|s| {
                let id = s.next_id();
                s.messages.push((
                    conversation_id,
                    id,
                    ChatTurn {
                        role,
                        content: content.to_string(),
                    },
                ));
                Ok(id)
            })
        })
    }

    fn recent_turns(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatTurn>>> {
        Box::pin(async move {
            let all = self.messages(conversation_id)?;
            let skip = all.len().saturating_sub(limit);
            Ok(all.into_iter().skip(skip).collect())
        })
    }

    fn save_artifact<'a>(
        &'a self,
        message_id: i64,
        artifact: &'a MessageArtifact,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|s| {
                s.artifacts.insert(message_id, artifact.clone());
                Ok(())
            })
        })
    }

    fn conversation_owner(&self, conversation_id: i64) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { self.with(|s| Ok(s.conversations.get(&conversation_id).cloned())) })
    }

    fn message(&self, message_id: i64) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.messages
                    .iter()
                    .find(|(_, id, _)| *id == message_id)
                    .map(|(conversation_id, id, turn)| StoredMessage {
                        id: *id,
                        conversation_id: *conversation_id,
                        role: turn.role,
                        content: turn.content.clone(),
                    }))
            })
        })
    }
}

impl AuditStore for MemoryStore {
    fn record_audit<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|s| {
                s.audits.push(record.clone());
                Ok(())
            })
        })
    }

    fn list_audits<'a>(
        &'a self,
        user: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<AuditRecord>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.audits
                    .iter()
                    .rev()
                    .filter(|a| a.user == user)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        })
    }
}

impl AccessStore for MemoryStore {
    fn upload_tables<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.uploads
                    .iter()
                    .filter(|(u, d, _)| u == user && d == datasource_id)
                    .map(|(_, _, t)| t.clone())
                    .collect())
            })
        })
    }

    fn table_scope<'a>(
        &'a self,
        user: &'a str,
        scope_id: i64,
    ) -> BoxFuture<'a, Result<Option<TableScope>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.scopes
                    .iter()
                    .find(|scope| scope.id == scope_id && scope.user == user)
                    .cloned())
            })
        })
    }

    fn list_scopes<'a>(
        &'a self,
        user: &'a str,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TableScope>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.scopes
                    .iter()
                    .rev()
                    .filter(|scope| scope.user == user && scope.datasource_id == datasource_id)
                    .cloned()
                    .collect())
            })
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
            let id = self.add_scope(user, datasource_id, name, tables.to_vec())?;
            self.with(|s| {
                s.scopes
                    .iter()
                    .find(|scope| scope.id == id)
                    .cloned()
                    .ok_or_else(|| anyhow!("scope {id} vanished"))
            })
        })
    }

    fn delete_scope<'a>(&'a self, user: &'a str, scope_id: i64) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.with(|s| {
                let before = s.scopes.len();
                s.scopes
                    .retain(|scope| !(scope.id == scope_id && scope.user == user));
                Ok(s.scopes.len() != before)
            })
        })
    }
}

impl SnapshotStore for MemoryStore {
    fn latest_snapshot<'a>(
        &'a self,
        datasource_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SchemaSnapshot>>> {
        Box::pin(async move { self.with(|s| Ok(s.snapshots.get(datasource_id).cloned())) })
    }

    fn save_snapshot<'a>(&'a self, snapshot: &'a SchemaSnapshot) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|s| {
                s.snapshots
                    .insert(snapshot.datasource_id.clone(), snapshot.clone());
                Ok(())
            })
        })
    }

    fn append_change<'a>(&'a self, record: &'a SchemaChangeRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with(|s| {
                s.changes.push(record.clone());
                Ok(())
            })
        })
    }

    fn list_changes<'a>(
        &'a self,
        datasource_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<SchemaChangeRecord>>> {
        Box::pin(async move {
            self.with(|s| {
                Ok(s.changes
                    .iter()
                    .rev()
                    .filter(|c| c.datasource_id == datasource_id)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        })
    }
}
