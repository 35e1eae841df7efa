//! Agent Core: the streaming response pipeline.
//!
//! Submodules:
//! - `orchestrator`: Per-conversation request state machine (stream, continue, fix)
//! - `classifier`: Folds model units into the response buffer, runs tool calls
//! - `tool_executor`: Tool registry, name resolution, timeout and result cap
//! - `tools`: Built-in project tools (`project.read_file`, `project.list_directory`)
//! - `continuation`: Bounded re-invocation for truncated `<write>` directives
//! - `autofix`: Diagnostics-driven fix rounds
//! - `tags`: Scanner for embedded directives, escaping, normalization
//! - `overlay`: Virtual file overlay and change application
//! - `diagnostics`: Static-analysis collaborator
//! - `streams`: Cancellation tokens and partial-response cache per conversation
//! - `context`, `prompts`: System prompt assembly
//! - `database`: SQLite persistence for conversations and messages
//! - `types`, `errors`: Shared types and agent-level errors

pub mod autofix;
pub mod classifier;
pub mod context;
pub mod continuation;
pub mod database;
pub mod diagnostics;
pub mod errors;
pub mod orchestrator;
pub mod overlay;
pub mod prompts;
pub mod streams;
pub mod tags;
pub mod tool_executor;
pub mod tools;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use database::{ChatStore, SqliteChatStore};
pub use diagnostics::{CommandDiagnostics, DiagnosticsCommand, DiagnosticsProvider, NoDiagnostics};
pub use errors::AgentError;
pub use orchestrator::{EventSink, OrchestratorSettings, StreamOrchestrator, StreamRequest};
pub use tool_executor::{Tool, ToolExecutor, ToolRegistry};
pub use types::{Attachment, ChatEvent, ChatMode, Conversation, Message, Problem, ProblemReport};
