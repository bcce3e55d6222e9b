use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use askql_common::circuit_breaker::CircuitOpen;
use askql_common::config::{AssistantSettings, MaskingSettings, QueryLimits};
use askql_common::index::IndexCatalog;
use askql_common::masking::Masker;
use askql_common::models::{RetrievalDocument, Role};
use askql_common::store::ConversationStore;
use askql_common::store::MemoryStore;
use askql_connectors::testing::{fake_gateway, FakeBackend, FakeFactory};
use askql_connectors::GatewayError;
use askql_error::ErrorClass;
use askql_runtime::collaborators::{
    AnalysisInput, AnalysisStream, Analyst, GenerationRequest, SqlAssistant, SqlGenerator,
};
use askql_runtime::orchestrator::{ErrorSite, Stage, WarningKind};
use askql_runtime::{
    BasicChartAdvisor, ChatRequest, Collaborators, Event, ExecuteError, ExecuteRequest,
    LlmError, MemoryIndexCatalog, Orchestrator, OrchestratorSettings, SessionEvent, Stores,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Returns `first` for the initial generation, then the queued rewrites.
struct ScriptedGenerator {
    first: Result<String, LlmError>,
    rewrites: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    repairs: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    fn new(first: &str, rewrites: &[&str]) -> Arc<Self> {
        Self::with_first(Ok(first.to_string()), rewrites)
    }

    fn with_first(first: Result<String, LlmError>, rewrites: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            first,
            rewrites: Mutex::new(rewrites.iter().map(|s| s.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
            repairs: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    fn repairs(&self) -> Vec<(String, String)> {
        lock(&self.repairs).clone()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        lock(&self.requests).push(request.clone());
        self.first.clone()
    }

    async fn repair(
        &self,
        _request: &GenerationRequest,
        failed_sql: &str,
        error: &str,
    ) -> Result<String, LlmError> {
        lock(&self.repairs).push((failed_sql.to_string(), error.to_string()));
        Ok(lock(&self.rewrites)
            .pop_front()
            .unwrap_or_else(|| failed_sql.to_string()))
    }
}

struct ChunkAnalyst {
    chunks: Vec<Result<String, LlmError>>,
}

impl Analyst for ChunkAnalyst {
    fn analyze(&self, _input: AnalysisInput) -> AnalysisStream {
        stream::iter(self.chunks.clone()).boxed()
    }
}

struct CannedAssistant;

#[async_trait]
impl SqlAssistant for CannedAssistant {
    async fn explain(&self, _sql: &str) -> String {
        "Counts orders per region.".to_string()
    }

    async fn suggest(&self, _q: &str, _sql: &str, _rows: usize, _ms: u64) -> String {
        "Add a date filter.".to_string()
    }

    async fn fix(&self, _sql: &str, _error: &str) -> String {
        String::new()
    }
}

struct Setup {
    generator: Arc<ScriptedGenerator>,
    analyst: Vec<Result<String, LlmError>>,
    assistant: Option<AssistantSettings>,
    limits: QueryLimits,
    failure_threshold: u32,
}

impl Setup {
    fn new(generator: Arc<ScriptedGenerator>) -> Self {
        Self {
            generator,
            analyst: vec![Ok("Sales ".to_string()), Ok("rose.".to_string())],
            assistant: None,
            limits: QueryLimits {
                max_rows: 100,
                max_sql_repairs: 2,
                query_timeout_secs: 5,
                slow_query_threshold_ms: 3000,
                retrieval_k: 6,
                history_limit: 20,
            },
            failure_threshold: 10,
        }
    }

    async fn build(self) -> Harness {
        let backend = FakeBackend::new();
        backend.set_schema(&[
            ("customers", &[("id", "int"), ("name", "varchar(64)")]),
            ("orders", &[("id", "int"), ("region", "varchar(16)"), ("total", "decimal(10,2)")]),
            ("tmp_staging", &[("id", "int")]),
        ]);
        backend.set_default_result(
            &["region", "total"],
            vec![
                vec![json!("north"), json!(12)],
                vec![json!("south"), json!(7)],
            ],
        );
        let gateway = Arc::new(fake_gateway(
            FakeFactory::new(backend.clone()),
            &["shop"],
            self.failure_threshold,
        ));

        let indexes = Arc::new(MemoryIndexCatalog::new(None));
        indexes
            .index_for("shop")
            .upsert(vec![RetrievalDocument {
                id: "table::orders".to_string(),
                text: "TABLE orders:\n  - region (varchar(16))".to_string(),
                metadata: BTreeMap::new(),
            }])
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let assistant: Option<Arc<dyn SqlAssistant>> = self
            .assistant
            .map(|_| Arc::new(CannedAssistant) as Arc<dyn SqlAssistant>);
        let orchestrator = Orchestrator::new(
            gateway,
            indexes,
            Collaborators {
                generator: self.generator.clone(),
                analyst: Arc::new(ChunkAnalyst {
                    chunks: self.analyst,
                }),
                assistant,
                charts: Arc::new(BasicChartAdvisor),
            },
            Stores {
                conversations: store.clone(),
                audits: store.clone(),
                access: store.clone(),
            },
            Masker::new(&MaskingSettings::default()),
            OrchestratorSettings {
                limits: self.limits,
                assistant: self.assistant.unwrap_or_default(),
            },
        );
        Harness {
            backend,
            store,
            generator: self.generator,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

struct Harness {
    backend: Arc<FakeBackend>,
    store: Arc<MemoryStore>,
    generator: Arc<ScriptedGenerator>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn ask(&self, question: &str, conversation_id: Option<i64>) -> Vec<SessionEvent> {
        self.orchestrator
            .stream(ChatRequest {
                user: "alice".to_string(),
                datasource_id: "shop".to_string(),
                conversation_id,
                question: question.to_string(),
                scope_id: None,
                table_lock: false,
            })
            .collect()
            .await
    }
}

fn names(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::name).collect()
}

fn done_flags(events: &[SessionEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e.event {
            Event::Done { ok } => Some(ok),
            _ => None,
        })
        .collect()
}

fn errors(events: &[SessionEvent]) -> Vec<(ErrorSite, ErrorClass, Option<Vec<String>>)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            Event::Error {
                site, class, tables, ..
            } => Some((*site, *class, tables.clone())),
            _ => None,
        })
        .collect()
}

fn sql_events(events: &[SessionEvent]) -> Vec<(String, Option<String>)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            Event::Sql { sql, note } => Some((sql.clone(), note.clone())),
            _ => None,
        })
        .collect()
}

fn execution_attempts(events: &[SessionEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e.event {
            Event::Status {
                stage: Stage::SqlExecution,
                attempt,
            } => attempt,
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_session_event_order() {
    let h = Setup::new(ScriptedGenerator::new(
        "SELECT region, SUM(total) AS total FROM orders GROUP BY region",
        &[],
    ))
    .build()
    .await;

    let events = h.ask("sales by region", None).await;

    assert_eq!(
        names(&events),
        vec![
            "message", "status", "status", "sql", "status", "table", "status", "chart", "status",
            "analysis", "analysis", "analysis", "done",
        ]
    );
    let request_id = &events[0].request_id;
    assert!(!request_id.is_empty());
    assert!(events.iter().all(|e| &e.request_id == request_id));
    assert_eq!(done_flags(&events), vec![true]);
    assert!(errors(&events).is_empty());

    match &events[5].event {
        Event::Table { row_count, .. } => assert_eq!(*row_count, 2),
        other => panic!("expected table, got {other:?}"),
    }
    match &events[7].event {
        Event::Chart { echarts_option } => assert!(echarts_option.is_some()),
        other => panic!("expected chart, got {other:?}"),
    }
    assert_eq!(
        events[11].event,
        Event::Analysis {
            text: "Sales rose.".to_string(),
            done: true
        }
    );

    // Retrieved schema reaches the generator.
    let requests = h.generator.requests();
    assert!(requests[0].schema_context.contains("TABLE orders"));
    assert_eq!(requests[0].allowed_tables, vec!["customers", "orders"]);

    let audits = h.store.audits().unwrap();
    assert_eq!(audits.len(), 1);
    assert!(audits[0].success);
    assert_eq!(audits[0].row_count, 2);
}

#[tokio::test]
async fn test_completion_persists_message_and_artifact() {
    let sql = "SELECT region, total FROM orders";
    let h = Setup::new(ScriptedGenerator::new(sql, &[])).build().await;

    let events = h.ask("orders by region", None).await;
    let user_message_id = match events[0].event {
        Event::Message { user_message_id } => user_message_id.unwrap(),
        ref other => panic!("expected message, got {other:?}"),
    };

    let conversation = h.store.audits().unwrap()[0].conversation_id.unwrap();
    let turns = h.store.messages(conversation).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "orders by region");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].content, format!("[SQL]\n{sql}\n\n[Analysis]\nSales rose."));

    let artifact = h.store.artifact(user_message_id).unwrap().unwrap();
    assert_eq!(artifact.sql, sql);
    assert_eq!(artifact.rows.len(), 2);
    assert_eq!(artifact.analysis, "Sales rose.");

    // The next question in the same conversation carries the history.
    h.ask("and last year?", Some(conversation)).await;
    let history = &h.generator.requests()[1].history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "orders by region");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_repair_succeeds() {
    let h = Setup::new(ScriptedGenerator::new(
        "SELECT region FROM orders",
        &["SELECT region, total FROM orders"],
    ))
    .build()
    .await;
    // Enough failures to exhaust the gateway's own retries.
    for _ in 0..3 {
        h.backend
            .push_error(GatewayError::Connection("server has gone away".to_string()));
    }

    let events = h.ask("sales by region", None).await;

    // Attempts are numbered from 0.
    assert_eq!(execution_attempts(&events), vec![0, 1]);
    let sqls = sql_events(&events);
    assert_eq!(sqls.len(), 2);
    assert_eq!(
        sqls.iter().filter(|(_, note)| note.as_deref() == Some("retry_rewrite")).count(),
        1
    );
    assert_eq!(
        errors(&events),
        vec![(ErrorSite::SqlExecution, ErrorClass::Transient, None)]
    );
    assert_eq!(done_flags(&events), vec![true]);

    let audits = h.store.audits().unwrap();
    assert_eq!(audits.iter().map(|a| a.success).collect::<Vec<_>>(), vec![false, true]);
    assert_eq!(h.backend.fetch_count(), 4);

    let repairs = h.generator.repairs();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].0, "SELECT region FROM orders");
    assert!(repairs[0].1.contains("server has gone away"));
}

#[tokio::test]
async fn test_disallowed_table_never_reaches_gateway() {
    let h = Setup::new(ScriptedGenerator::new(
        "SELECT o.id FROM orders o JOIN salaries s ON s.id = o.id",
        &[],
    ))
    .build()
    .await;

    let events = h.ask("who earns the most", None).await;

    assert_eq!(
        errors(&events),
        vec![(
            ErrorSite::SqlAllowlist,
            ErrorClass::Authorization,
            Some(vec!["salaries".to_string()])
        )]
    );
    assert_eq!(done_flags(&events), vec![false]);
    assert!(execution_attempts(&events).is_empty());
    assert_eq!(h.backend.fetch_count(), 0);
    assert!(h.store.audits().unwrap().is_empty());
    assert!(h.generator.repairs().is_empty());
}

#[tokio::test]
async fn test_temp_tables_are_not_allowed() {
    let h = Setup::new(ScriptedGenerator::new("SELECT id FROM tmp_staging", &[]))
        .build()
        .await;

    let events = h.ask("staging rows", None).await;

    assert_eq!(errors(&events)[0].2, Some(vec!["tmp_staging".to_string()]));
    assert_eq!(h.backend.fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_stops_repairs() {
    let mut setup = Setup::new(ScriptedGenerator::new(
        "SELECT region FROM orders",
        &["SELECT region, total FROM orders"],
    ));
    setup.failure_threshold = 1;
    let h = setup.build().await;
    for _ in 0..3 {
        h.backend
            .push_error(GatewayError::Connection("connection refused".to_string()));
    }

    let events = h.ask("sales by region", None).await;

    let classes: Vec<ErrorClass> = errors(&events).into_iter().map(|(_, c, _)| c).collect();
    assert_eq!(classes, vec![ErrorClass::Transient, ErrorClass::CircuitOpen]);
    assert_eq!(done_flags(&events), vec![false]);
    // The second attempt was refused without touching the backend, and the
    // remaining repair budget was not used.
    assert_eq!(h.backend.fetch_count(), 3);
    assert_eq!(h.generator.repairs().len(), 1);
    assert_eq!(h.store.audits().unwrap().len(), 2);
}

#[tokio::test]
async fn test_repair_budget_is_bounded() {
    let mut setup = Setup::new(ScriptedGenerator::new(
        "SELECT nope FROM orders",
        &["SELECT still_nope FROM orders", "SELECT never_used FROM orders"],
    ));
    setup.limits.max_sql_repairs = 1;
    let h = setup.build().await;
    for _ in 0..2 {
        h.backend.push_error(GatewayError::Database {
            code: Some(1054),
            message: "Unknown column".to_string(),
            retryable: false,
        });
    }

    let events = h.ask("sales", None).await;

    assert_eq!(execution_attempts(&events), vec![0, 1]);
    assert_eq!(h.generator.repairs().len(), 1);
    assert_eq!(errors(&events).len(), 2);
    assert_eq!(done_flags(&events), vec![false]);
    assert_eq!(names(&events).last(), Some(&"done"));
}

#[tokio::test]
async fn test_internal_execution_error_is_repaired() {
    let h = Setup::new(ScriptedGenerator::new(
        "SELECT region FROM orders",
        &["SELECT region, total FROM orders"],
    ))
    .build()
    .await;
    h.backend
        .push_error(GatewayError::Internal("packet out of order".to_string()));

    let events = h.ask("sales by region", None).await;

    assert_eq!(
        errors(&events),
        vec![(ErrorSite::SqlExecution, ErrorClass::Internal, None)]
    );
    assert_eq!(execution_attempts(&events), vec![0, 1]);
    assert_eq!(h.generator.repairs().len(), 1);
    assert!(h.generator.repairs()[0].1.contains("packet out of order"));
    assert_eq!(done_flags(&events), vec![true]);
}

#[tokio::test]
async fn test_generation_failure_ends_session() {
    let h = Setup::new(ScriptedGenerator::with_first(
        Err(LlmError::CircuitOpen(CircuitOpen {
            name: "llm_chat".to_string(),
        })),
        &[],
    ))
    .build()
    .await;

    let events = h.ask("anything", None).await;

    assert_eq!(
        errors(&events),
        vec![(ErrorSite::LlmSql, ErrorClass::CircuitOpen, None)]
    );
    assert_eq!(
        names(&events),
        vec!["message", "status", "status", "error", "done"]
    );
    assert_eq!(h.backend.fetch_count(), 0);
}

#[tokio::test]
async fn test_unknown_datasource_fails_at_table_listing() {
    let h = Setup::new(ScriptedGenerator::new("SELECT 1", &[])).build().await;

    let events: Vec<SessionEvent> = h
        .orchestrator
        .stream(ChatRequest {
            user: "alice".to_string(),
            datasource_id: "missing".to_string(),
            question: "anything".to_string(),
            ..Default::default()
        })
        .collect()
        .await;

    let errs = errors(&events);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].0, ErrorSite::SchemaTables);
    assert_eq!(done_flags(&events), vec![false]);
    assert!(h.generator.requests().is_empty());
}

#[tokio::test]
async fn test_analysis_failure_keeps_session_ok() {
    let mut setup = Setup::new(ScriptedGenerator::new("SELECT region FROM orders", &[]));
    setup.analyst = vec![
        Ok("Partial".to_string()),
        Err(LlmError::UnexpectedShape {
            service: "llm_chat",
            detail: "no delta".to_string(),
        }),
    ];
    let h = setup.build().await;

    let events = h.ask("sales", None).await;

    assert_eq!(
        errors(&events),
        vec![(ErrorSite::Analysis, ErrorClass::UpstreamShape, None)]
    );
    assert_eq!(done_flags(&events), vec![true]);
    assert!(events.iter().any(|e| e.event
        == Event::Analysis {
            text: "Partial".to_string(),
            done: true
        }));
}

#[tokio::test(start_paused = true)]
async fn test_slow_capped_result_warns_and_suggests() {
    let mut setup = Setup::new(ScriptedGenerator::new("SELECT region, total FROM orders", &[]));
    setup.limits.max_rows = 2;
    setup.limits.slow_query_threshold_ms = 10;
    setup.assistant = Some(AssistantSettings {
        explain: true,
        suggest: true,
        fix: false,
    });
    let h = setup.build().await;
    h.backend.set_delay(Duration::from_millis(50));

    let events = h.ask("sales", None).await;

    let warnings: Vec<WarningKind> = events
        .iter()
        .filter_map(|e| match e.event {
            Event::Warning { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![WarningKind::SlowQuery, WarningKind::RowCap]);

    let order = names(&events);
    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert_eq!(pos("sql_explain"), pos("sql") + 1);
    assert!(pos("sql_suggest") > pos("warning"));
    assert!(pos("sql_suggest") < pos("chart"));

    assert!(h.store.audits().unwrap()[0].slow);
}

#[tokio::test]
async fn test_sensitive_columns_are_masked() {
    let h = Setup::new(ScriptedGenerator::new("SELECT name, email FROM customers", &[]))
        .build()
        .await;
    h.backend.set_default_result(
        &["name", "email"],
        vec![vec![json!("Alice"), json!("alice@example.com")]],
    );

    let events = h.ask("customer emails", None).await;

    let rows = events
        .iter()
        .find_map(|e| match &e.event {
            Event::Table { rows, .. } => Some(rows.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(rows[0][0], json!("Alice"));
    assert_eq!(rows[0][1], json!("al*************om"));
}

#[tokio::test]
async fn test_dropped_stream_stops_work() {
    let h = Setup::new(ScriptedGenerator::new("SELECT region FROM orders", &[]))
        .build()
        .await;

    let mut events = h.orchestrator.stream(ChatRequest {
        user: "alice".to_string(),
        datasource_id: "shop".to_string(),
        question: "sales".to_string(),
        ..Default::default()
    });
    // message, status(schema_retrieval), status(sql_generation)
    for _ in 0..3 {
        events.next().await.unwrap();
    }
    drop(events);

    assert!(h.generator.requests().is_empty());
    assert_eq!(h.backend.fetch_count(), 0);
}

#[tokio::test]
async fn test_session_reports_stage_history() {
    let h = Setup::new(ScriptedGenerator::new("SELECT region FROM orders", &[]))
        .build()
        .await;
    let mut session = h.orchestrator.session(ChatRequest {
        user: "alice".to_string(),
        datasource_id: "shop".to_string(),
        question: "sales".to_string(),
        ..Default::default()
    });

    let mut count = 0;
    while let Some(event) = session.next_event().await {
        assert_eq!(event.request_id, session.request_id());
        count += 1;
    }

    assert!(session.is_finished());
    assert!(session.next_event().await.is_none());
    assert_eq!(session.current_sql(), "SELECT region FROM orders");
    assert_eq!(
        session.stages(),
        &[
            Stage::SchemaRetrieval,
            Stage::SqlGeneration,
            Stage::SqlExecution,
            Stage::ChartGeneration,
            Stage::AnalysisGeneration,
        ]
    );
    assert!(count > 5);
}

#[tokio::test]
async fn test_execute_returns_result_with_tips() {
    let h = Setup::new(ScriptedGenerator::new("unused", &[])).build().await;
    let conversation = h
        .store
        .ensure_conversation("alice", None, "manual")
        .await
        .unwrap();
    let message = h
        .store
        .add_message(conversation, Role::User, "orders by region")
        .await
        .unwrap();

    let response = h
        .orchestrator
        .execute(ExecuteRequest {
            user: "alice".to_string(),
            datasource_id: "shop".to_string(),
            sql: "  SELECT * FROM orders  ".to_string(),
            conversation_id: Some(conversation),
            message_id: Some(message),
            analyze: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(response.sql, "SELECT * FROM orders");
    assert_eq!(response.row_count, 2);
    assert_eq!(response.analysis.as_deref(), Some("Sales rose."));
    assert!(!response.slow);
    assert!(response.explain.is_none());
    assert_eq!(response.safety.len(), 3);
    assert!(h.store.artifact(message).unwrap().is_some());
    assert_eq!(h.store.audits().unwrap().len(), 1);
}

#[tokio::test]
async fn test_execute_checks_conversation_and_message_ownership() {
    let h = Setup::new(ScriptedGenerator::new("unused", &[])).build().await;
    let store = &h.store;
    let alices = store.ensure_conversation("alice", None, "a").await.unwrap();
    let question = store.add_message(alices, Role::User, "orders?").await.unwrap();
    let answer = store
        .add_message(alices, Role::Assistant, "[SQL]\nSELECT 1")
        .await
        .unwrap();
    let bobs = store.ensure_conversation("bob", None, "b").await.unwrap();
    let bobs_question = store.add_message(bobs, Role::User, "mine").await.unwrap();

    let request = |user: &str, conversation_id: Option<i64>, message_id: Option<i64>| {
        ExecuteRequest {
            user: user.to_string(),
            datasource_id: "shop".to_string(),
            sql: "SELECT id FROM customers".to_string(),
            conversation_id,
            message_id,
            ..Default::default()
        }
    };

    let err = h
        .orchestrator
        .execute(request("bob", Some(alices), Some(question)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Forbidden(id) if id == alices));

    let err = h
        .orchestrator
        .execute(request("alice", Some(9_999), Some(question)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::ConversationNotFound(9_999)));

    let err = h
        .orchestrator
        .execute(request("alice", Some(alices), Some(bobs_question)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::MessageNotFound { .. }));

    let err = h
        .orchestrator
        .execute(request("alice", Some(alices), Some(answer)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::NotUserMessage));

    let err = h
        .orchestrator
        .execute(request("alice", None, Some(question)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::MissingConversation));

    // Nothing was run or written for the rejected requests.
    assert_eq!(h.backend.fetch_count(), 0);
    assert!(h.store.audits().unwrap().is_empty());
    assert!(h.store.artifact(question).unwrap().is_none());
    assert!(h.store.artifact(bobs_question).unwrap().is_none());

    let ok = h
        .orchestrator
        .execute(request("alice", Some(alices), Some(question)))
        .await
        .unwrap();
    assert_eq!(ok.row_count, 2);
    assert_eq!(h.store.artifact(question).unwrap().unwrap().sql, ok.sql);
}

#[tokio::test]
async fn test_execute_rejects_disallowed_and_empty_sql() {
    let h = Setup::new(ScriptedGenerator::new("unused", &[])).build().await;
    let request = |sql: &str| ExecuteRequest {
        user: "alice".to_string(),
        datasource_id: "shop".to_string(),
        sql: sql.to_string(),
        ..Default::default()
    };

    let err = h
        .orchestrator
        .execute(request("SELECT * FROM salaries"))
        .await
        .unwrap_err();
    match err {
        ExecuteError::Authorization(e) => assert_eq!(e.disallowed, vec!["salaries"]),
        other => panic!("expected authorization error, got {other:?}"),
    }

    let err = h.orchestrator.execute(request("   ")).await.unwrap_err();
    assert!(matches!(err, ExecuteError::EmptySql));

    let err = h
        .orchestrator
        .execute(request("DELETE FROM orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Gateway(GatewayError::Validation(_))));

    assert_eq!(h.backend.fetch_count(), 0);
    // Only the statement that reached the gateway is audited.
    assert_eq!(h.store.audits().unwrap().len(), 1);
}
