//! In-crate fakes for orchestrator tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};

use super::database::{ChatStore, SqliteChatStore};
use super::diagnostics::{DiagnosticsError, DiagnosticsProvider};
use super::orchestrator::{OrchestratorSettings, StreamOrchestrator, StreamRequest};
use super::overlay::VirtualFileOverlay;
use super::tool_executor::{ToolExecutor, ToolRegistry};
use super::tools::{ListDirectoryTool, ReadFileTool};
use super::types::{ChatEvent, Message, Problem, ProblemReport};
use crate::inference::client::{ModelClient, UnitStream};
use crate::inference::errors::InferenceError;
use crate::inference::types::{ModelRequest, StreamUnit, ToolCall};

/// One scripted model invocation.
pub enum Reply {
    Units(Vec<StreamUnit>),
    /// Yields the units, then never produces another item.
    UnitsThenHang(Vec<StreamUnit>),
    UnitsThenError(Vec<StreamUnit>, String),
    /// Yields the first units, waits for the gate, then yields the rest.
    UnitsThenGate(Vec<StreamUnit>, Arc<Notify>, Vec<StreamUnit>),
    /// The invocation itself fails.
    Fail(String),
}

pub fn text(s: &str) -> StreamUnit {
    StreamUnit::Text(s.to_string())
}

pub fn reasoning(s: &str) -> StreamUnit {
    StreamUnit::Reasoning(s.to_string())
}

pub fn tool_call(name: &str, arguments: serde_json::Value) -> StreamUnit {
    StreamUnit::ToolCall(ToolCall {
        id: "call_0".into(),
        name: name.to_string(),
        arguments,
    })
}

/// Model client that replays a fixed script and records every request.
/// Once the script runs out it returns empty streams.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn ok_units(
    units: Vec<StreamUnit>,
) -> impl Stream<Item = Result<StreamUnit, InferenceError>> + Send {
    stream::iter(units.into_iter().map(Ok))
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream_chat(&self, request: ModelRequest) -> Result<UnitStream, InferenceError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Units(Vec::new()));

        match reply {
            Reply::Units(units) => Ok(Box::pin(ok_units(units))),
            Reply::UnitsThenHang(units) => Ok(Box::pin(ok_units(units).chain(stream::pending()))),
            Reply::UnitsThenError(units, reason) => Ok(Box::pin(
                ok_units(units).chain(stream::once(async move {
                    Err(InferenceError::StreamError { reason })
                })),
            )),
            Reply::UnitsThenGate(before, gate, after) => Ok(Box::pin(
                ok_units(before).chain(
                    stream::once(async move {
                        gate.notified().await;
                        ok_units(after)
                    })
                    .flatten(),
                ),
            )),
            Reply::Fail(reason) => Err(InferenceError::ConnectionFailed {
                endpoint: "scripted".into(),
                reason,
            }),
        }
    }
}

/// Diagnostics that replay a queue of reports; clean once it runs out.
#[derive(Default)]
pub struct ScriptedDiagnostics {
    reports: Mutex<VecDeque<Result<ProblemReport, DiagnosticsError>>>,
    calls: AtomicUsize,
}

impl ScriptedDiagnostics {
    pub fn new(reports: Vec<Result<ProblemReport, DiagnosticsError>>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticsProvider for ScriptedDiagnostics {
    async fn check(
        &self,
        _project_root: &Path,
        _overlay: &VirtualFileOverlay,
    ) -> Result<ProblemReport, DiagnosticsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProblemReport::default()))
    }
}

pub fn problems(n: usize) -> ProblemReport {
    ProblemReport {
        problems: (0..n)
            .map(|i| Problem {
                file: "src/a.ts".into(),
                line: i as u32 + 1,
                column: 1,
                code: "TS2304".into(),
                message: format!("Cannot find name 'x{i}'."),
                snippet: None,
            })
            .collect(),
    }
}

/// An orchestrator over an in-memory store and a scratch project.
pub struct Harness {
    pub orchestrator: Arc<StreamOrchestrator>,
    pub model: Arc<ScriptedModel>,
    pub diagnostics: Arc<ScriptedDiagnostics>,
    pub store: Arc<SqliteChatStore>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
    pub conversation_id: i64,
    pub root: tempfile::TempDir,
}

impl Harness {
    pub fn new(replies: Vec<Reply>, reports: Vec<Result<ProblemReport, DiagnosticsError>>) -> Self {
        Self::with_settings(replies, reports, OrchestratorSettings::default())
    }

    pub fn with_settings(
        replies: Vec<Reply>,
        reports: Vec<Result<ProblemReport, DiagnosticsError>>,
        settings: OrchestratorSettings,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(replies));
        let diagnostics = Arc::new(ScriptedDiagnostics::new(reports));
        let store = Arc::new(SqliteChatStore::open(":memory:").unwrap());
        let conversation_id = store.create_conversation(Some("test")).unwrap().id;

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadFileTool::new(root.path())));
        registry.register(Arc::new(ListDirectoryTool::new(root.path())));
        let tools = ToolExecutor::new(Arc::new(registry));

        let (tx, events) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(StreamOrchestrator::new(
            model.clone(),
            store.clone(),
            tools,
            diagnostics.clone(),
            Arc::new(tx),
            root.path().to_path_buf(),
            settings,
        ));

        Self {
            orchestrator,
            model,
            diagnostics,
            store,
            events,
            conversation_id,
            root,
        }
    }

    pub fn request(&self, prompt: &str) -> StreamRequest {
        StreamRequest {
            conversation_id: self.conversation_id,
            prompt: prompt.to_string(),
            attachments: Vec::new(),
            mode: None,
        }
    }

    /// Every event pushed so far.
    pub fn drain(&mut self) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Persisted content of the newest assistant message.
    pub fn final_content(&self) -> String {
        self.messages()
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.list_messages(self.conversation_id).unwrap()
    }
}
