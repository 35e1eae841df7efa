//! Stream orchestrator.
//!
//! Drives one request per conversation through a bounded state machine:
//!
//! 1. **Streaming**: the primary model stream is folded into the response
//!    buffer unit by unit, with a snapshot pushed to the UI after each one.
//! 2. **Continuing**: a truncated `<write>` triggers follow-up calls that
//!    seed the buffer as the assistant's own turn.
//! 3. **Fixing**: diagnostics over a virtual overlay drive fix rounds.
//! 4. **Done** / **Cancelled** / **Failed**: the assistant message is
//!    finalized and an end-of-stream or error event is pushed.
//!
//! Every loop is bounded by an attempt counter; cancellation is checked after
//! each unit and before each phase.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio::sync::mpsc;

use super::autofix::{self, AutoFixController, DEFAULT_MAX_AUTO_FIX_ATTEMPTS};
use super::classifier::ChunkAccumulator;
use super::context::{codebase_context, ContextLimits};
use super::continuation::{ContinuationController, DEFAULT_MAX_CONTINUATIONS};
use super::database::ChatStore;
use super::diagnostics::DiagnosticsProvider;
use super::errors::AgentError;
use super::overlay::{apply_to_disk, VirtualFileOverlay};
use super::prompts::{prompt_with_attachments, system_prompt};
use super::streams::{ActiveStreams, StreamHandle};
use super::tags::{has_unclosed_write, normalize, problem_report_block};
use super::tool_executor::{ToolExecutor, ToolOutcome};
use super::types::{Attachment, ChatEvent, ChatMode, Message, ProblemReport};
use crate::inference::client::ModelClient;
use crate::inference::errors::InferenceError;
use crate::inference::types::{
    ChatMessage, FunctionCallResponse, ModelRequest, Role, StreamUnit, ToolCall, ToolCallResponse,
};

/// Appended to the partial response when the user cancels.
pub const CANCELLED_MARKER: &str = "\n\n[Response cancelled by user]";

/// Follow-up model calls allowed after native tool calls, per model turn.
pub const MAX_TOOL_STEPS: u32 = 5;

// ─── Collaborators ──────────────────────────────────────────────────────────

/// Fire-and-forget channel to the UI.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChatEvent);
}

impl EventSink for mpsc::UnboundedSender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        // The UI may have gone away; the request still finishes.
        if self.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub chat_mode: ChatMode,
    pub auto_fix_problems: bool,
    pub auto_apply_changes: bool,
    pub max_continuation_attempts: u32,
    pub max_auto_fix_attempts: u32,
    pub context: ContextLimits,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            chat_mode: ChatMode::Build,
            auto_fix_problems: true,
            auto_apply_changes: false,
            max_continuation_attempts: DEFAULT_MAX_CONTINUATIONS,
            max_auto_fix_attempts: DEFAULT_MAX_AUTO_FIX_ATTEMPTS,
            context: ContextLimits {
                max_files: 200,
                max_bytes: 200_000,
            },
        }
    }
}

/// One user turn to stream a reply for.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub conversation_id: i64,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    /// Overrides the configured chat mode for this request.
    pub mode: Option<ChatMode>,
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Streaming,
    Continuing { attempt: u32 },
    Fixing { attempt: u32 },
    Done,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled | Phase::Failed)
    }
}

/// How one model invocation ended.
enum DriveEnd {
    Finished,
    Cancelled,
    Failed(InferenceError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UnitFilter {
    All,
    TextOnly,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct StreamOrchestrator {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn ChatStore>,
    tools: ToolExecutor,
    diagnostics: Arc<dyn DiagnosticsProvider>,
    sink: Arc<dyn EventSink>,
    project_root: PathBuf,
    settings: RwLock<OrchestratorSettings>,
    streams: ActiveStreams,
}

impl StreamOrchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Arc<dyn ChatStore>,
        tools: ToolExecutor,
        diagnostics: Arc<dyn DiagnosticsProvider>,
        sink: Arc<dyn EventSink>,
        project_root: PathBuf,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            store,
            tools,
            diagnostics,
            sink,
            project_root,
            settings: RwLock::new(settings),
            streams: ActiveStreams::new(),
        }
    }

    pub fn project_root(&self) -> &std::path::Path {
        &self.project_root
    }

    /// Applies to requests started after the call.
    pub fn update_settings(&self, settings: OrchestratorSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn settings(&self) -> OrchestratorSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_streaming(&self, conversation_id: i64) -> bool {
        self.streams.is_active(conversation_id)
    }

    /// Cancel the active request for `conversation_id`.
    ///
    /// Idempotent; returns whether a running request was signalled.
    pub fn cancel_stream(&self, conversation_id: i64) -> bool {
        let found = self.streams.cancel(conversation_id);
        if !found {
            tracing::debug!(conversation_id, "cancel requested with no active stream");
        }
        found
    }

    /// Stream a reply to `request` until it reaches a terminal state.
    ///
    /// Returns the conversation id. Model failures on the primary stream and
    /// persistence failures come back as errors after an `error` event has
    /// been pushed; the stream entry is released on every path.
    pub async fn start_stream(&self, request: StreamRequest) -> Result<i64, AgentError> {
        let conversation_id = request.conversation_id;
        let handle = self.streams.register(conversation_id);
        tracing::info!(
            conversation_id,
            generation = handle.generation,
            prompt_len = request.prompt.len(),
            "=== STREAM START ==="
        );

        let result = self.run_request(&handle, request).await;

        match &result {
            Ok(phase) => tracing::info!(conversation_id, ?phase, "=== STREAM END ==="),
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "stream failed");
                if self.streams.is_current(&handle) {
                    self.sink.emit(ChatEvent::Error {
                        conversation_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.streams.release(&handle);
        result.map(|_| conversation_id)
    }

    async fn run_request(
        &self,
        handle: &StreamHandle,
        request: StreamRequest,
    ) -> Result<Phase, AgentError> {
        let conversation_id = request.conversation_id;
        self.store.get_conversation(conversation_id)?;

        let settings = self.settings();
        let mode = request.mode.unwrap_or(settings.chat_mode);

        let prompt = prompt_with_attachments(&request.prompt, &request.attachments);
        self.store
            .insert_message(conversation_id, Role::User, &prompt)?;
        let placeholder = self
            .store
            .insert_message(conversation_id, Role::Assistant, "")?;
        let messages = self.store.list_messages(conversation_id)?;

        let base = self.base_request(mode, &settings, &messages, placeholder.id).await;

        let mut run = RequestRun {
            orch: self,
            handle: handle.clone(),
            continuation: ContinuationController::new(settings.max_continuation_attempts),
            settings,
            mode,
            assistant_id: placeholder.id,
            messages,
            base,
            acc: ChunkAccumulator::new(),
            last_snapshot: String::new(),
            fixer: None,
            report: ProblemReport::default(),
            failure: None,
        };
        run.push_snapshot();
        run.run().await
    }

    async fn base_request(
        &self,
        mode: ChatMode,
        settings: &OrchestratorSettings,
        messages: &[Message],
        placeholder_id: i64,
    ) -> ModelRequest {
        let root = self.project_root.clone();
        let limits = settings.context;
        let context = tokio::task::spawn_blocking(move || codebase_context(&root, limits))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "codebase context task failed");
                String::new()
            });

        let history = messages
            .iter()
            .filter(|m| m.id != placeholder_id && !m.content.is_empty())
            .map(|m| ChatMessage {
                role: m.role,
                content: Some(m.content.clone()),
                tool_call_id: None,
                tool_calls: None,
            })
            .collect();

        let registry = self.tools.registry();
        ModelRequest {
            system_prompt: system_prompt(mode, &context),
            messages: history,
            tools: (!registry.is_empty()).then(|| registry.to_tool_definitions()),
        }
    }
}

// ─── Per-request state ──────────────────────────────────────────────────────

/// Everything scoped to a single request. Dropped when it ends.
struct RequestRun<'a> {
    orch: &'a StreamOrchestrator,
    handle: StreamHandle,
    settings: OrchestratorSettings,
    mode: ChatMode,
    assistant_id: i64,
    /// Message list as last pushed; the placeholder is the final entry.
    messages: Vec<Message>,
    base: ModelRequest,
    acc: ChunkAccumulator,
    last_snapshot: String,
    continuation: ContinuationController,
    fixer: Option<AutoFixController>,
    report: ProblemReport,
    failure: Option<InferenceError>,
}

impl RequestRun<'_> {
    fn conversation_id(&self) -> i64 {
        self.handle.conversation_id
    }

    async fn run(&mut self) -> Result<Phase, AgentError> {
        let mut phase = Phase::Streaming;
        loop {
            if !phase.is_terminal() && self.handle.token.is_cancelled() {
                phase = Phase::Cancelled;
            }
            tracing::debug!(conversation_id = self.conversation_id(), ?phase, "phase");

            phase = match phase {
                Phase::Streaming => self.stream_primary().await,
                Phase::Continuing { attempt } => self.continue_write(attempt).await,
                Phase::Fixing { attempt } => self.fix_round(attempt).await,
                Phase::Done => {
                    self.finish().await?;
                    return Ok(Phase::Done);
                }
                Phase::Cancelled => {
                    self.finish_cancelled()?;
                    return Ok(Phase::Cancelled);
                }
                Phase::Failed => {
                    let content = self.acc.buffer().to_string();
                    self.persist(&content)?;
                    let error = self.failure.take().unwrap_or(InferenceError::StreamError {
                        reason: "model stream failed".into(),
                    });
                    return Err(error.into());
                }
            };
        }
    }

    // ── Phases ──────────────────────────────────────────────────────────────

    async fn stream_primary(&mut self) -> Phase {
        match self.drive(self.base.clone(), UnitFilter::All).await {
            DriveEnd::Finished => {}
            DriveEnd::Cancelled => return Phase::Cancelled,
            DriveEnd::Failed(e) => {
                self.acc.close_thinking();
                self.failure = Some(e);
                return Phase::Failed;
            }
        }

        self.acc.close_thinking();
        if self.acc.run_embedded_tool_calls(&self.orch.tools).await > 0 {
            self.push_snapshot();
        }
        self.after_write_check().await
    }

    async fn continue_write(&mut self, attempt: u32) -> Phase {
        let request = self.continuation.next_request(&self.base, self.acc.buffer());
        tracing::info!(
            conversation_id = self.conversation_id(),
            attempt,
            "continuing truncated write"
        );

        match self.drive(request, UnitFilter::TextOnly).await {
            DriveEnd::Finished => self.after_write_check().await,
            DriveEnd::Cancelled => Phase::Cancelled,
            DriveEnd::Failed(e) => {
                tracing::warn!(
                    conversation_id = self.conversation_id(),
                    attempt,
                    error = %e,
                    "continuation failed, keeping buffer as-is"
                );
                self.enter_fixing().await
            }
        }
    }

    async fn after_write_check(&mut self) -> Phase {
        if self.continuation.should_continue(self.acc.buffer()) {
            return Phase::Continuing {
                attempt: self.continuation.attempts() + 1,
            };
        }
        if self.continuation.budget_exhausted() && has_unclosed_write(self.acc.buffer()) {
            tracing::warn!(
                conversation_id = self.conversation_id(),
                attempts = self.continuation.attempts(),
                "write still open after continuation budget"
            );
        }
        self.enter_fixing().await
    }

    async fn enter_fixing(&mut self) -> Phase {
        if let Err(skip) =
            autofix::eligibility(self.settings.auto_fix_problems, self.mode, self.acc.buffer())
        {
            tracing::debug!(conversation_id = self.conversation_id(), ?skip, "auto-fix skipped");
            return Phase::Done;
        }

        self.fixer = Some(AutoFixController::new(
            self.settings.max_auto_fix_attempts,
            self.acc.buffer(),
        ));
        match self.diagnose().await {
            Ok(report) => self.next_fix(report),
            Err(phase) => phase,
        }
    }

    async fn fix_round(&mut self, attempt: u32) -> Phase {
        let Some(fixer) = self.fixer.as_mut() else {
            return Phase::Done;
        };
        let request = fixer.next_request(&self.base, &self.report);
        tracing::info!(
            conversation_id = self.conversation_id(),
            attempt,
            problems = self.report.len(),
            "auto-fix round"
        );

        let block = problem_report_block(&self.report);
        self.acc.push_text(&format!("\n\n{block}\n\n"));
        self.push_snapshot();
        self.acc.take_appended();

        let end = self.drive(request, UnitFilter::All).await;
        self.acc.close_thinking();
        if matches!(end, DriveEnd::Finished)
            && self.acc.run_embedded_tool_calls(&self.orch.tools).await > 0
        {
            self.push_snapshot();
        }
        let reply = self.acc.take_appended();
        if let Some(fixer) = self.fixer.as_mut() {
            fixer.record_reply(reply);
        }

        match end {
            DriveEnd::Finished => match self.diagnose().await {
                Ok(report) => self.next_fix(report),
                Err(phase) => phase,
            },
            DriveEnd::Cancelled => Phase::Cancelled,
            DriveEnd::Failed(e) => {
                tracing::warn!(
                    conversation_id = self.conversation_id(),
                    attempt,
                    error = %e,
                    "auto-fix model call failed, keeping best buffer"
                );
                Phase::Done
            }
        }
    }

    /// Check the projected tree. `Err` carries the phase to move to instead.
    async fn diagnose(&self) -> Result<ProblemReport, Phase> {
        let root = self.orch.project_root.as_path();
        let overlay = VirtualFileOverlay::build(root, self.acc.buffer());
        let result = tokio::select! {
            biased;
            _ = self.handle.token.cancelled() => return Err(Phase::Cancelled),
            result = self.orch.diagnostics.check(root, &overlay) => result,
        };
        match result {
            Ok(report) => {
                tracing::info!(
                    conversation_id = self.conversation_id(),
                    files = overlay.changed_paths().len(),
                    problems = report.len(),
                    "diagnostics complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = self.conversation_id(),
                    error = %e,
                    "diagnostics failed, skipping auto-fix"
                );
                Err(Phase::Done)
            }
        }
    }

    fn next_fix(&mut self, report: ProblemReport) -> Phase {
        let Some(fixer) = self.fixer.as_ref() else {
            return Phase::Done;
        };
        if fixer.should_fix(&report) {
            let attempt = fixer.attempts() + 1;
            self.report = report;
            return Phase::Fixing { attempt };
        }
        if !report.is_empty() {
            tracing::warn!(
                conversation_id = self.conversation_id(),
                problems = report.len(),
                "problems remain after auto-fix budget"
            );
        }
        Phase::Done
    }

    // ── Model stream ────────────────────────────────────────────────────────

    /// Fold one model turn into the buffer. Dropping the stream on
    /// cancellation aborts the invocation.
    ///
    /// When a step ends after native tool calls, the model is invoked again
    /// with the assistant's tool calls and their results appended, up to
    /// [`MAX_TOOL_STEPS`] follow-ups.
    async fn drive(&mut self, mut request: ModelRequest, filter: UnitFilter) -> DriveEnd {
        let mut step = 0;
        loop {
            let mut turn = ToolTurn::default();
            match self.drive_step(request.clone(), filter, &mut turn).await {
                DriveEnd::Finished if !turn.calls.is_empty() => {}
                end => return end,
            }
            if step >= MAX_TOOL_STEPS {
                tracing::warn!(
                    conversation_id = self.conversation_id(),
                    steps = step,
                    "tool step limit reached"
                );
                return DriveEnd::Finished;
            }
            step += 1;
            tracing::info!(
                conversation_id = self.conversation_id(),
                step,
                tool_calls = turn.calls.len(),
                "resuming after tool calls"
            );
            turn.append_to(&mut request.messages);
        }
    }

    async fn drive_step(
        &mut self,
        request: ModelRequest,
        filter: UnitFilter,
        turn: &mut ToolTurn,
    ) -> DriveEnd {
        let token = self.handle.token.clone();
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return DriveEnd::Cancelled,
            opened = self.orch.model.stream_chat(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return DriveEnd::Failed(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return DriveEnd::Cancelled,
                next = stream.next() => next,
            };
            let unit = match next {
                None => return DriveEnd::Finished,
                Some(Err(e)) => return DriveEnd::Failed(e),
                Some(Ok(unit)) => unit,
            };

            let call = match &unit {
                StreamUnit::Text(text) => {
                    turn.text.push_str(text);
                    None
                }
                StreamUnit::ToolCall(call) if filter == UnitFilter::All => Some(call.clone()),
                _ if filter == UnitFilter::TextOnly => {
                    tracing::debug!("ignoring non-text unit in continuation");
                    continue;
                }
                _ => None,
            };
            let outcome = self.acc.push(unit, &self.orch.tools).await;
            if let (Some(call), Some(outcome)) = (call, outcome) {
                turn.calls.push((call, outcome));
            }
            self.push_snapshot();

            if token.is_cancelled() {
                return DriveEnd::Cancelled;
            }
        }
    }

    // ── Snapshots and finalization ──────────────────────────────────────────

    /// Push the buffer to the UI and the partial cache. Superseded requests
    /// stay silent.
    fn push_snapshot(&mut self) {
        if !self.orch.streams.is_current(&self.handle) {
            return;
        }
        let content = self.acc.buffer().to_string();
        self.orch.streams.set_partial(&self.handle, &content);
        self.emit_snapshot(content);
    }

    fn emit_snapshot(&mut self, content: String) {
        if let Some(placeholder) = self.messages.last_mut() {
            placeholder.content = content.clone();
        }
        self.last_snapshot = content;
        self.orch.sink.emit(ChatEvent::Snapshot {
            conversation_id: self.conversation_id(),
            messages: self.messages.clone(),
        });
    }

    fn emit_if_current(&self, event: ChatEvent) {
        if self.orch.streams.is_current(&self.handle) {
            self.orch.sink.emit(event);
        }
    }

    fn persist(&self, content: &str) -> Result<(), AgentError> {
        self.orch
            .store
            .update_message_content(self.assistant_id, content)
    }

    async fn finish(&mut self) -> Result<(), AgentError> {
        let content = normalize(self.acc.buffer());
        self.persist(&content)?;
        if self.orch.streams.is_current(&self.handle) && content != self.last_snapshot {
            self.emit_snapshot(content.clone());
        }

        let applied = self.apply_changes(&content).await;
        self.emit_if_current(ChatEvent::End {
            conversation_id: self.conversation_id(),
            updated_files: applied.updated_files,
            extra_files: applied.extra_files,
            extra_files_error: applied.extra_files_error,
        });
        Ok(())
    }

    fn finish_cancelled(&mut self) -> Result<(), AgentError> {
        let partial = self
            .orch
            .streams
            .partial(&self.handle)
            .unwrap_or_else(|| self.last_snapshot.clone());
        tracing::info!(
            conversation_id = self.conversation_id(),
            partial_len = partial.len(),
            "stream cancelled"
        );

        let content = format!("{partial}{CANCELLED_MARKER}");
        self.persist(&content)?;
        if self.orch.streams.is_current(&self.handle) {
            self.emit_snapshot(content);
        }
        self.emit_if_current(ChatEvent::End {
            conversation_id: self.conversation_id(),
            updated_files: false,
            extra_files: None,
            extra_files_error: None,
        });
        Ok(())
    }

    async fn apply_changes(&self, content: &str) -> AppliedChanges {
        if !self.settings.auto_apply_changes || self.mode == ChatMode::Ask {
            return AppliedChanges::default();
        }
        let overlay = VirtualFileOverlay::build(self.orch.project_root.as_path(), content);
        if overlay.is_empty() {
            return AppliedChanges::default();
        }
        match apply_to_disk(&overlay).await {
            Ok(paths) => AppliedChanges {
                updated_files: !paths.is_empty(),
                extra_files: Some(paths),
                extra_files_error: None,
            },
            Err(e) => {
                tracing::warn!(
                    conversation_id = self.conversation_id(),
                    error = %e,
                    "failed to apply changes"
                );
                AppliedChanges {
                    updated_files: false,
                    extra_files: None,
                    extra_files_error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Native tool calls made during one model step, with the text that
/// preceded them.
#[derive(Default)]
struct ToolTurn {
    text: String,
    calls: Vec<(ToolCall, ToolOutcome)>,
}

impl ToolTurn {
    /// Append the assistant tool-call turn and one `tool` message per result.
    fn append_to(self, messages: &mut Vec<ChatMessage>) {
        let tool_calls = self
            .calls
            .iter()
            .map(|(call, _)| ToolCallResponse {
                id: call.id.clone(),
                r#type: "function".to_string(),
                function: FunctionCallResponse {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect();
        messages.push(ChatMessage {
            role: Role::Assistant,
            content: (!self.text.is_empty()).then_some(self.text),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        });
        for (call, outcome) in self.calls {
            messages.push(ChatMessage {
                role: Role::Tool,
                content: Some(outcome.text),
                tool_call_id: Some(call.id),
                tool_calls: None,
            });
        }
    }
}

#[derive(Debug, Default)]
struct AppliedChanges {
    updated_files: bool,
    extra_files: Option<Vec<String>>,
    extra_files_error: Option<String>,
}
