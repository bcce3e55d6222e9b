use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::info;
use validator::Validate;

use askql_common::models::{
    AuditRecord, DatasourceSummary, QueryResult, SchemaChangeRecord, TableInfo, TableScope,
};
use askql_connectors::{DriftOutcome, GatewayError};
use askql_error::{AskqlError, ErrorClass, ErrorCode};
use askql_runtime::{
    AllowlistResolver, AuthorizationError, ChatRequest, ExecuteRequest, ExecuteResponse,
};

use crate::error::ApiError;
use crate::identity::Caller;
use crate::metrics::{StreamGuard, CHAT_SESSIONS, SQL_EXECUTIONS};
use crate::state::AppState;

pub const DEFAULT_PREVIEW_ROWS: usize = 20;
pub const DEFAULT_AUDIT_LIMIT: usize = 200;
pub const DEFAULT_CHANGE_LIMIT: usize = 20;
pub const MAX_SCOPE_NAME_CHARS: usize = 40;

/// Everything mounted under `/api`.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .merge(create_chat_router())
        .merge(create_schema_router())
        .merge(create_scope_router())
        .merge(create_admin_router())
        .with_state(state)
}

pub fn create_chat_router() -> Router<AppState> {
    Router::new()
        .route("/chat/sse", post(chat_sse))
        .route("/sql/execute", post(execute_sql))
}

pub fn create_schema_router() -> Router<AppState> {
    Router::new()
        .route("/schema/tables", get(list_tables))
        .route("/schema/tables/{table}/preview", get(preview_table))
        .route("/schema/changes", get(list_changes))
        .route("/schema/check", post(check_schema))
}

pub fn create_scope_router() -> Router<AppState> {
    Router::new()
        .route("/scopes", get(list_scopes).post(create_scope))
        .route("/scopes/{id}", delete(delete_scope))
}

pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/audits/sql", get(list_audits))
        .route("/datasources", get(list_datasources))
        .route("/datasources/{id}/ping", get(ping_datasource))
}

fn validated<T: Validate>(input: T) -> Result<T, ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::validation(e.to_string().replace('\n', "; ")))?;
    Ok(input)
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChatBody {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub scope_id: Option<i64>,
    #[serde(default)]
    pub table_lock: bool,
}

async fn chat_sse(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let body = validated(body)?;
    let question = body.question.trim().to_string();
    if question.is_empty() {
        return Err(ApiError::validation("question must not be blank"));
    }

    CHAT_SESSIONS.inc();
    let guard = StreamGuard::new();
    let events = state
        .orchestrator
        .stream(ChatRequest {
            user: caller.user,
            datasource_id: caller.datasource_id,
            conversation_id: body.conversation_id,
            question,
            scope_id: body.scope_id,
            table_lock: body.table_lock,
        })
        .map(move |event| {
            let _live = &guard;
            Ok(SseEvent::default()
                .event(event.name())
                .data(event.payload().to_string()))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub sql: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub scope_id: Option<i64>,
    #[serde(default)]
    pub analyze: bool,
}

async fn execute_sql(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let result = state
        .orchestrator
        .execute(ExecuteRequest {
            user: caller.user,
            datasource_id: caller.datasource_id,
            sql: body.sql,
            conversation_id: body.conversation_id,
            message_id: body.message_id,
            question: body.question,
            scope_id: body.scope_id,
            analyze: body.analyze,
        })
        .await;

    let outcome = if result.is_ok() { "ok" } else { "error" };
    SQL_EXECUTIONS.with_label_values(&[outcome]).inc();
    Ok(Json(result?))
}

/// Tables the caller may query, in catalog order.
async fn list_tables(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<TableInfo>>, ApiError> {
    let allowed = AllowlistResolver::new(&state.gateway, state.access.as_ref())
        .resolve(&caller.user, &caller.datasource_id, None)
        .await?;
    let tables = state
        .gateway
        .list_tables(&caller.datasource_id)
        .await?
        .into_iter()
        .filter(|t| allowed.contains(&t.name))
        .collect();
    Ok(Json(tables))
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn preview_table(
    State(state): State<AppState>,
    caller: Caller,
    Path(table): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<QueryResult>, ApiError> {
    let allowed = AllowlistResolver::new(&state.gateway, state.access.as_ref())
        .resolve(&caller.user, &caller.datasource_id, None)
        .await?;
    let known = state
        .gateway
        .list_tables(&caller.datasource_id)
        .await?
        .iter()
        .any(|t| t.name == table);
    if known && !allowed.contains(&table) {
        return Err(AuthorizationError {
            disallowed: vec![table.clone()],
            referenced: vec![table],
        }
        .into());
    }

    let mut result = state
        .gateway
        .preview_table(
            &caller.datasource_id,
            &table,
            query.limit.unwrap_or(DEFAULT_PREVIEW_ROWS),
        )
        .await?;
    state.masker.mask_rows(&result.columns, &mut result.rows);
    Ok(Json(result))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LimitQuery {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
}

async fn list_changes(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<SchemaChangeRecord>>, ApiError> {
    let query = validated(query)?;
    let changes = state
        .snapshots
        .list_changes(
            &caller.datasource_id,
            query.limit.unwrap_or(DEFAULT_CHANGE_LIMIT),
        )
        .await
        .map_err(storage_error)?;
    Ok(Json(changes))
}

/// Run a drift check now, ignoring the interval gate.
async fn check_schema(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<DriftOutcome>, ApiError> {
    let outcome = state.monitor.check(&caller.datasource_id, true).await?;
    Ok(Json(outcome))
}

/// The caller's own execution audits, newest first.
async fn list_audits(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let query = validated(query)?;
    let audits = state
        .audits
        .list_audits(&caller.user, query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
        .await
        .map_err(storage_error)?;
    Ok(Json(audits))
}

async fn list_scopes(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<TableScope>>, ApiError> {
    let scopes = state
        .access
        .list_scopes(&caller.user, &caller.datasource_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(scopes))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ScopeBody {
    pub name: String,
    #[validate(length(min = 1, message = "tables list is required"))]
    pub tables: Vec<String>,
}

async fn create_scope(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<ScopeBody>,
) -> Result<Json<TableScope>, ApiError> {
    let body = validated(body)?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("scope name is required"));
    }
    if name.chars().count() > MAX_SCOPE_NAME_CHARS {
        return Err(ApiError::validation(format!(
            "scope name is longer than {MAX_SCOPE_NAME_CHARS} characters"
        )));
    }
    let tables: Vec<String> = body
        .tables
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tables.is_empty() {
        return Err(ApiError::validation("tables list is required"));
    }

    let scope = state
        .access
        .create_scope(&caller.user, &caller.datasource_id, name, &tables)
        .await
        .map_err(storage_error)?;
    info!(user = %caller.user, scope_id = scope.id, tables = tables.len(), "table scope created");
    Ok(Json(scope))
}

async fn delete_scope(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .access
        .delete_scope(&caller.user, id)
        .await
        .map_err(storage_error)?;
    if !deleted {
        return Err(ApiError::not_found(format!("scope {id} not found")));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn list_datasources(State(state): State<AppState>) -> Json<Vec<DatasourceSummary>> {
    let registry = state.gateway.registry();
    let summaries = registry
        .datasource_ids()
        .iter()
        .filter_map(|id| registry.datasource(id))
        .map(DatasourceSummary::from)
        .collect();
    Json(summaries)
}

async fn ping_datasource(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.gateway.registry().datasource(&id).is_none() {
        return Err(GatewayError::UnknownDatasource(id).into());
    }
    let ok = state.gateway.ping(&id).await;
    Ok(Json(json!({ "datasource_id": id, "ok": ok })))
}

fn storage_error(err: anyhow::Error) -> ApiError {
    ApiError(
        AskqlError::new(ErrorCode::StorageFailed, format!("{err:#}")).with_class(ErrorClass::Internal),
    )
}
