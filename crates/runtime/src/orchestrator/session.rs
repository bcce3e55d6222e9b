//! The per-request state machine behind the chat event stream.
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use askql_common::models::{AuditRecord, MessageArtifact, QueryRequest, QueryResult, Role};
use askql_error::{Classify, ErrorClass};

use crate::authorizer::{AllowedTableSet, AllowlistResolver};
use crate::collaborators::{AnalysisInput, AnalysisStream, GenerationRequest};
use crate::llm::{LlmError, ANALYSIS_ROW_LIMIT};

use super::events::{ErrorSite, Event, SessionEvent, Stage, WarningKind};
use super::{best_effort, ChatRequest, Orchestrator};

const REPAIR_NOTE: &str = "retry_rewrite";

enum Step {
    Start,
    Announce { stage: Stage, attempt: Option<u32>, then: Box<Step> },
    Retrieve,
    Generate,
    Explain,
    Authorize,
    Execute,
    Fix { error: String },
    Repair { error: String },
    SlowWarning,
    CapWarning,
    Suggest,
    Chart,
    AnalysisStart,
    Analysis(AnalysisStream),
    AnalysisDone,
    Persist,
    Finish { ok: bool },
    Closed,
}

/// State of one chat request. Created by [`Orchestrator::session`] and
/// driven by [`OrchestrationSession::next_event`]; never shared.
pub struct OrchestrationSession {
    orchestrator: Arc<Orchestrator>,
    request: ChatRequest,
    request_id: String,
    span: Span,
    step: Step,
    stages: Vec<Stage>,

    conversation_id: Option<i64>,
    user_message_id: Option<i64>,
    generation: GenerationRequest,
    allowed: Option<AllowedTableSet>,
    sql: String,
    executions: u32,
    repairs: u32,
    last_error: Option<String>,

    result: Option<QueryResult>,
    slow: bool,
    capped: bool,
    chart: Option<Value>,
    analysis: String,
}

impl OrchestrationSession {
    pub(super) fn new(orchestrator: Arc<Orchestrator>, request: ChatRequest) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "chat",
            request_id = %request_id,
            user = %request.user,
            datasource = %request.datasource_id
        );
        Self {
            orchestrator,
            request,
            request_id,
            span,
            step: Step::Start,
            stages: Vec::new(),
            conversation_id: None,
            user_message_id: None,
            generation: GenerationRequest::default(),
            allowed: None,
            sql: String::new(),
            executions: 0,
            repairs: 0,
            last_error: None,
            result: None,
            slow: false,
            capped: false,
            chart: None,
            analysis: String::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stages announced so far, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The statement most recently generated or repaired.
    pub fn current_sql(&self) -> &str {
        &self.sql
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.step, Step::Closed)
    }

    /// Run until the next event is ready. `None` once `done` has been
    /// returned.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let span = self.span.clone();
        while !self.is_finished() {
            if let Some(event) = self.advance().instrument(span.clone()).await {
                return Some(SessionEvent {
                    request_id: self.request_id.clone(),
                    event,
                });
            }
        }
        None
    }

    /// One transition. Sets the next step and returns the event it emits,
    /// if any.
    async fn advance(&mut self) -> Option<Event> {
        let orch = self.orchestrator.clone();
        match std::mem::replace(&mut self.step, Step::Closed) {
            Step::Start => {
                self.open_conversation(&orch).await;
                self.step = announce(Stage::SchemaRetrieval, None, Step::Retrieve);
                Some(Event::Message {
                    user_message_id: self.user_message_id,
                })
            }
            Step::Announce {
                stage,
                attempt,
                then,
            } => {
                self.stages.push(stage);
                self.step = *then;
                Some(Event::Status { stage, attempt })
            }
            Step::Retrieve => {
                self.step = announce(Stage::SqlGeneration, None, Step::Generate);
                let index = orch.indexes.index_for(&self.request.datasource_id);
                let k = orch.settings.limits.retrieval_k;
                match index.search(&self.request.question, k).await {
                    Ok(hits) => {
                        debug!(hits = hits.len(), "schema context retrieved");
                        self.generation.schema_context = hits
                            .into_iter()
                            .map(|h| h.text)
                            .collect::<Vec<_>>()
                            .join("\n\n");
                        None
                    }
                    Err(e) => {
                        // Generation still runs, without schema context.
                        warn!(error = %e, "schema retrieval failed");
                        let class = e
                            .downcast_ref::<LlmError>()
                            .map(|e| e.class())
                            .unwrap_or(ErrorClass::Internal);
                        Some(self.error(ErrorSite::SchemaRetrieval, e.to_string(), class, None))
                    }
                }
            }
            Step::Generate => self.generate(&orch).await,
            Step::Explain => {
                self.step = Step::Authorize;
                let assistant = orch.assistant_for(orch.settings.assistant.explain)?;
                let explain = assistant.explain(&self.sql).await;
                (!explain.is_empty()).then(|| Event::SqlExplain {
                    sql: self.sql.clone(),
                    explain,
                })
            }
            Step::Authorize => {
                let verdict = match &self.allowed {
                    Some(allowed) => allowed.authorize(&self.sql),
                    None => {
                        self.step = Step::Finish { ok: false };
                        return None;
                    }
                };
                match verdict {
                    Ok(()) => {
                        // Attempts are numbered from 0.
                        let attempt = self.executions;
                        self.executions += 1;
                        self.step = announce(Stage::SqlExecution, Some(attempt), Step::Execute);
                        None
                    }
                    Err(e) => {
                        warn!(disallowed = ?e.disallowed, "statement rejected by allowlist");
                        let tables = e.disallowed.clone();
                        self.step = Step::Finish { ok: false };
                        Some(self.error(ErrorSite::SqlAllowlist, e.to_string(), e.class(), Some(tables)))
                    }
                }
            }
            Step::Execute => Some(self.execute(&orch).await),
            Step::Fix { error } => {
                let assistant = orch.assistant_for(orch.settings.assistant.fix);
                let fix = match assistant {
                    Some(assistant) => assistant.fix(&self.sql, &error).await,
                    None => String::new(),
                };
                self.step = announce(Stage::SqlRepair, Some(self.repairs + 1), Step::Repair { error });
                (!fix.is_empty()).then(|| Event::SqlFix {
                    sql: self.sql.clone(),
                    fix,
                })
            }
            Step::Repair { error } => {
                match orch
                    .collaborators
                    .generator
                    .repair(&self.generation, &self.sql, &error)
                    .await
                {
                    Ok(sql) if !sql.trim().is_empty() => {
                        self.repairs += 1;
                        info!(repair = self.repairs, "statement rewritten");
                        self.sql = sql;
                        self.step = self.after_sql();
                        Some(Event::Sql {
                            sql: self.sql.clone(),
                            note: Some(REPAIR_NOTE.to_string()),
                        })
                    }
                    Ok(_) => Some(self.generation_failed("the SQL generator returned no statement".to_string(), ErrorClass::UpstreamShape)),
                    Err(e) => Some(self.generation_failed(e.to_string(), e.class())),
                }
            }
            Step::SlowWarning => {
                self.step = Step::CapWarning;
                let elapsed_ms = self.result.as_ref().map_or(0, |r| r.elapsed_ms);
                self.slow.then(|| Event::Warning {
                    kind: WarningKind::SlowQuery,
                    message: format!(
                        "Query took {elapsed_ms} ms (threshold {} ms)",
                        orch.settings.limits.slow_query_threshold_ms
                    ),
                })
            }
            Step::CapWarning => {
                self.step = Step::Suggest;
                self.capped.then(|| Event::Warning {
                    kind: WarningKind::RowCap,
                    message: format!(
                        "Result truncated to {} rows",
                        orch.settings.limits.max_rows
                    ),
                })
            }
            Step::Suggest => {
                self.step = announce(Stage::ChartGeneration, None, Step::Chart);
                if !(self.slow || self.capped) {
                    return None;
                }
                let assistant = orch.assistant_for(orch.settings.assistant.suggest)?;
                let result = self.result.as_ref()?;
                let suggest = assistant
                    .suggest(
                        &self.request.question,
                        &self.sql,
                        result.row_count(),
                        result.elapsed_ms,
                    )
                    .await;
                (!suggest.is_empty()).then(|| Event::SqlSuggest {
                    sql: self.sql.clone(),
                    suggest,
                })
            }
            Step::Chart => {
                self.step = announce(Stage::AnalysisGeneration, None, Step::AnalysisStart);
                self.chart = self
                    .result
                    .as_ref()
                    .and_then(|r| orch.collaborators.charts.suggest(&r.columns, &r.rows));
                Some(Event::Chart {
                    echarts_option: self.chart.clone(),
                })
            }
            Step::AnalysisStart => {
                let Some(result) = self.result.as_ref() else {
                    self.step = Step::AnalysisDone;
                    return None;
                };
                let input = AnalysisInput {
                    question: self.request.question.clone(),
                    sql: self.sql.clone(),
                    columns: result.columns.clone(),
                    rows: result.rows.iter().take(ANALYSIS_ROW_LIMIT).cloned().collect(),
                    row_count: result.row_count(),
                };
                self.step = Step::Analysis(orch.collaborators.analyst.analyze(input));
                None
            }
            Step::Analysis(mut chunks) => match chunks.next().await {
                Some(Ok(delta)) => {
                    self.step = Step::Analysis(chunks);
                    if delta.is_empty() {
                        return None;
                    }
                    self.analysis.push_str(&delta);
                    Some(Event::AnalysisDelta { delta })
                }
                Some(Err(e)) => {
                    warn!(error = %e, "analysis stream failed");
                    self.step = Step::AnalysisDone;
                    Some(self.error(ErrorSite::Analysis, e.to_string(), e.class(), None))
                }
                None => {
                    self.step = Step::AnalysisDone;
                    None
                }
            },
            Step::AnalysisDone => {
                self.step = Step::Persist;
                self.analysis = self.analysis.trim().to_string();
                Some(Event::Analysis {
                    text: self.analysis.clone(),
                    done: true,
                })
            }
            Step::Persist => {
                self.persist(&orch).await;
                self.step = Step::Finish { ok: true };
                None
            }
            Step::Finish { ok } => {
                info!(
                    ok,
                    executions = self.executions,
                    repairs = self.repairs,
                    "chat session finished"
                );
                Some(Event::Done { ok })
            }
            Step::Closed => None,
        }
    }

    async fn open_conversation(&mut self, orch: &Orchestrator) {
        let conversations = &orch.stores.conversations;
        let title: String = self.request.question.chars().take(60).collect();
        self.conversation_id = best_effort(
            "conversation write",
            conversations.ensure_conversation(&self.request.user, self.request.conversation_id, &title),
        )
        .await;
        let Some(conversation_id) = self.conversation_id else {
            return;
        };
        // History is read before the question itself is stored.
        if let Some(history) = best_effort(
            "history read",
            conversations.recent_turns(conversation_id, orch.settings.limits.history_limit),
        )
        .await
        {
            self.generation.history = history;
        }
        self.user_message_id = best_effort(
            "message write",
            conversations.add_message(conversation_id, Role::User, &self.request.question),
        )
        .await;
    }

    async fn generate(&mut self, orch: &Orchestrator) -> Option<Event> {
        if self.allowed.is_none() {
            let resolver = AllowlistResolver::new(&orch.gateway, orch.stores.access.as_ref());
            match resolver
                .resolve(
                    &self.request.user,
                    &self.request.datasource_id,
                    self.request.scope_id,
                )
                .await
            {
                Ok(allowed) => self.allowed = Some(allowed),
                Err(e) => {
                    warn!(error = %e, "table list unavailable");
                    self.step = Step::Finish { ok: false };
                    return Some(self.error(ErrorSite::SchemaTables, e.to_string(), e.class(), None));
                }
            }
        }

        self.generation.question = self.request.question.clone();
        self.generation.allowed_tables = self.allowed.as_ref().map(AllowedTableSet::names).unwrap_or_default();
        self.generation.table_lock = self.request.table_lock;
        self.generation.max_rows = orch.settings.limits.max_rows;

        match orch.collaborators.generator.generate(&self.generation).await {
            Ok(sql) if !sql.trim().is_empty() => {
                self.sql = sql;
                self.step = self.after_sql();
                Some(Event::Sql {
                    sql: self.sql.clone(),
                    note: None,
                })
            }
            Ok(_) => Some(self.generation_failed(
                "the SQL generator returned no statement".to_string(),
                ErrorClass::UpstreamShape,
            )),
            Err(e) => Some(self.generation_failed(e.to_string(), e.class())),
        }
    }

    async fn execute(&mut self, orch: &Orchestrator) -> Event {
        let limits = &orch.settings.limits;
        let request = QueryRequest {
            datasource_id: self.request.datasource_id.clone(),
            sql: self.sql.clone(),
            max_rows: limits.max_rows,
            timeout: Duration::from_secs(limits.query_timeout_secs),
        };
        let started = tokio::time::Instant::now();
        let outcome = orch.gateway.execute(&request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut result) => {
                self.slow = result.elapsed_ms >= limits.slow_query_threshold_ms;
                self.capped = result.row_count() >= limits.max_rows;
                orch.record_attempt(self.audit(result.row_count(), result.elapsed_ms, None))
                    .await;
                orch.masker.mask_rows(&result.columns, &mut result.rows);
                let event = Event::Table {
                    columns: result.columns.clone(),
                    rows: result.rows.clone(),
                    row_count: result.row_count(),
                };
                self.result = Some(result);
                self.step = Step::SlowWarning;
                event
            }
            Err(e) => {
                let message = e.to_string();
                let class = e.class();
                orch.record_attempt(self.audit(0, elapsed_ms, Some(message.clone())))
                    .await;

                let budget_left = self.repairs < limits.max_sql_repairs;
                self.step = if class == ErrorClass::CircuitOpen {
                    warn!(error = %e, "breaker open; not repairing");
                    Step::Finish { ok: false }
                } else if !class.is_repairable() || !budget_left {
                    warn!(error = %e, class = %class, repairs = self.repairs, "execution failed; giving up");
                    Step::Finish { ok: false }
                } else {
                    debug!(error = %e, "execution failed; asking for a rewrite");
                    Step::Fix {
                        error: message.clone(),
                    }
                };
                self.error(ErrorSite::SqlExecution, message, class, None)
            }
        }
    }

    /// The assistant reply is stored as a message; the artifact is keyed by
    /// the user message that asked for it, so a later re-run replaces it.
    async fn persist(&mut self, orch: &Orchestrator) {
        let Some(conversation_id) = self.conversation_id else {
            return;
        };
        let content = format!("[SQL]\n{}\n\n[Analysis]\n{}", self.sql, self.analysis);
        let conversations = &orch.stores.conversations;
        best_effort(
            "message write",
            conversations.add_message(conversation_id, Role::Assistant, &content),
        )
        .await;
        let (Some(message_id), Some(result)) = (self.user_message_id, &self.result) else {
            return;
        };
        let artifact = MessageArtifact {
            sql: self.sql.clone(),
            columns: result.columns.clone(),
            rows: result.rows.clone(),
            chart: self.chart.clone(),
            analysis: self.analysis.clone(),
        };
        best_effort("artifact write", conversations.save_artifact(message_id, &artifact)).await;
    }

    fn after_sql(&self) -> Step {
        let orch = &self.orchestrator;
        if orch.assistant_for(orch.settings.assistant.explain).is_some() {
            Step::Explain
        } else {
            Step::Authorize
        }
    }

    fn audit(&self, row_count: usize, elapsed_ms: u64, error: Option<String>) -> AuditRecord {
        AuditRecord {
            user: self.request.user.clone(),
            conversation_id: self.conversation_id,
            message_id: self.user_message_id,
            datasource_id: self.request.datasource_id.clone(),
            sql_text: self.sql.clone(),
            row_count,
            elapsed_ms,
            success: error.is_none(),
            error_message: error,
            slow: self.slow,
            created_at: Utc::now(),
        }
    }

    fn generation_failed(&mut self, message: String, class: ErrorClass) -> Event {
        warn!(error = %message, "SQL generation failed");
        self.step = Step::Finish { ok: false };
        self.error(ErrorSite::LlmSql, message, class, None)
    }

    fn error(
        &mut self,
        site: ErrorSite,
        message: String,
        class: ErrorClass,
        tables: Option<Vec<String>>,
    ) -> Event {
        self.last_error = Some(message.clone());
        Event::Error {
            message,
            site,
            class,
            tables,
        }
    }
}

fn announce(stage: Stage, attempt: Option<u32>, then: Step) -> Step {
    Step::Announce {
        stage,
        attempt,
        then: Box::new(then),
    }
}
