//! Question-to-SQL orchestration for askql.
//!
//! - `authorizer`: the per-request table allowlist.
//! - `orchestrator`: the chat state machine and synchronous execute.
//! - `collaborators`: traits for the generator, analyst, assistant and
//!   chart advisor, with OpenAI-compatible implementations in `llm`.
//! - `index`: the in-memory retrieval index over schema documents.
pub mod authorizer;
pub mod chart;
pub mod collaborators;
pub mod index;
pub mod llm;
pub mod orchestrator;
pub mod safety;

pub use authorizer::{AllowedTableSet, AllowlistResolver, AuthorizationError};
pub use chart::BasicChartAdvisor;
pub use index::{Embedder, MemoryIndex, MemoryIndexCatalog};
pub use llm::LlmError;
pub use orchestrator::{
    ChatRequest, Collaborators, Event, ExecuteError, ExecuteRequest, ExecuteResponse,
    Orchestrator, OrchestratorSettings, SessionEvent, Stores,
};
