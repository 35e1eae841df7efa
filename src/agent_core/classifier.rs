//! Chunk classifier and response buffer.
//!
//! Folds model output units into the single growing response buffer:
//! reasoning goes inside `<think>` markers (escaped so it never scans as a
//! directive), text is appended verbatim, and tool calls are executed on the
//! spot with their result spliced in as a `[tool …]` block.

use super::tags::{embedded_tool_calls, escape_tags, normalize};
use super::tool_executor::{ToolExecutor, ToolOutcome};
use crate::inference::types::StreamUnit;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Substrings whose arrival can make normalization change the buffer.
const NORMALIZE_TRIGGERS: &[&str] = &["think>", "</problem-report>"];
/// Bytes before an append that are rechecked, so a marker split across
/// units is still seen.
const TRIGGER_WINDOW: usize = 24;

/// Render a tool outcome as an inline block.
pub fn tool_block(outcome: &ToolOutcome) -> String {
    let status = if outcome.is_error { "error" } else { "result" };
    // Tool output is data; tag-like text in it must not act as a directive.
    format!(
        "\n\n[tool {} {status}]\n{}\n[/tool]\n\n",
        outcome.tool_name,
        escape_tags(&outcome.text)
    )
}

/// Classifier state for one request.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    thinking_open: bool,
    buffer: String,
    /// Raw text appended since the last [`take_appended`](Self::take_appended).
    appended: String,
    /// Set when an append may have created something to normalize.
    dirty: bool,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking_open
    }

    /// Everything appended since the last call, before normalization.
    pub fn take_appended(&mut self) -> String {
        std::mem::take(&mut self.appended)
    }

    fn append(&mut self, text: &str) {
        let mut from = self.buffer.len().saturating_sub(TRIGGER_WINDOW);
        while !self.buffer.is_char_boundary(from) {
            from -= 1;
        }
        self.buffer.push_str(text);
        self.appended.push_str(text);

        let tail = &self.buffer[from..];
        if NORMALIZE_TRIGGERS.iter().any(|t| tail.contains(t)) {
            self.dirty = true;
        }
    }

    /// Normalize only when the latest appends touched a marker; otherwise
    /// the buffer is already a fixpoint.
    fn normalize(&mut self) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }
        let normalized = normalize(&self.buffer);
        if normalized != self.buffer {
            self.buffer = normalized;
        }
    }

    /// Close an open `<think>` block.
    pub fn close_thinking(&mut self) {
        if self.thinking_open {
            self.append(THINK_CLOSE);
            self.thinking_open = false;
            self.normalize();
        }
    }

    /// Append answer text.
    pub fn push_text(&mut self, text: &str) {
        if self.thinking_open {
            self.append(THINK_CLOSE);
            self.thinking_open = false;
        }
        self.append(text);
        self.normalize();
    }

    /// Append reasoning text inside a `<think>` block.
    pub fn push_reasoning(&mut self, text: &str) {
        if !self.thinking_open {
            self.append(THINK_OPEN);
            self.thinking_open = true;
        }
        self.append(&escape_tags(text));
        self.normalize();
    }

    /// Append a tool outcome block.
    pub fn push_tool_outcome(&mut self, outcome: &ToolOutcome) {
        if self.thinking_open {
            self.append(THINK_CLOSE);
            self.thinking_open = false;
        }
        self.append(&tool_block(outcome));
        self.normalize();
    }

    /// Classify one unit. Tool calls run to completion before this returns
    /// and their outcome is handed back for the follow-up turn.
    pub async fn push(&mut self, unit: StreamUnit, tools: &ToolExecutor) -> Option<ToolOutcome> {
        match unit {
            StreamUnit::Text(text) => {
                self.push_text(&text);
                None
            }
            StreamUnit::Reasoning(text) => {
                self.push_reasoning(&text);
                None
            }
            StreamUnit::ToolCall(call) => {
                tracing::debug!(tool = %call.name, id = %call.id, "tool call unit");
                let outcome = tools.execute(&call.name, call.arguments).await;
                self.push_tool_outcome(&outcome);
                Some(outcome)
            }
        }
    }

    /// Execute every complete `<tool-call>` tag in the buffer once, in
    /// order, replacing each tag with its result block. Returns how many
    /// ran.
    pub async fn run_embedded_tool_calls(&mut self, tools: &ToolExecutor) -> usize {
        let calls = embedded_tool_calls(&self.buffer);
        if calls.is_empty() {
            return 0;
        }

        let mut rebuilt = String::with_capacity(self.buffer.len());
        let mut copied_to = 0;
        for call in &calls {
            let outcome = tools.execute(&call.name, call.arguments.clone()).await;
            rebuilt.push_str(&self.buffer[copied_to..call.start]);
            rebuilt.push_str(&tool_block(&outcome));
            copied_to = call.end;
        }
        rebuilt.push_str(&self.buffer[copied_to..]);

        tracing::info!(count = calls.len(), "executed embedded tool calls");
        self.buffer = normalize(&rebuilt);
        calls.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::agent_core::tags::{problem_report_block, scan};
    use crate::agent_core::types::{Problem, ProblemReport};
    use crate::agent_core::tool_executor::{Tool, ToolError, ToolRegistry};
    use crate::inference::types::ToolCall;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "test.echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            match args.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(json!(text)),
                None => Err(ToolError::Failed {
                    reason: "no text".into(),
                }),
            }
        }
    }

    fn executor() -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        ToolExecutor::new(Arc::new(reg))
    }

    fn call(args: serde_json::Value) -> StreamUnit {
        StreamUnit::ToolCall(ToolCall {
            id: "call_1".into(),
            name: "test.echo".into(),
            arguments: args,
        })
    }

    #[tokio::test]
    async fn test_reasoning_then_text() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push(StreamUnit::Reasoning("let me ".into()), &tools).await;
        acc.push(StreamUnit::Reasoning("think".into()), &tools).await;
        assert!(acc.is_thinking());
        acc.push(StreamUnit::Text("Answer".into()), &tools).await;
        assert!(!acc.is_thinking());
        assert_eq!(acc.buffer(), "<think>let me think</think>Answer");
    }

    #[tokio::test]
    async fn test_reasoning_is_escaped() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push(
            StreamUnit::Reasoning("I could <write path=\"a\">x</write>".into()),
            &tools,
        )
        .await;
        acc.close_thinking();
        let tags = scan(acc.buffer());
        assert_eq!(tags.len(), 1, "only the think block itself");
        assert!(acc.buffer().contains("＜write"));
    }

    #[tokio::test]
    async fn test_tool_call_result_block() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push(StreamUnit::Text("Reading.".into()), &tools).await;
        acc.push(call(json!({"text": "hello"})), &tools).await;
        assert_eq!(
            acc.buffer(),
            "Reading.\n\n[tool test.echo result]\nhello\n[/tool]\n\n"
        );
    }

    #[tokio::test]
    async fn test_tool_error_does_not_abort() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push(call(json!({})), &tools).await;
        acc.push(StreamUnit::Text("after".into()), &tools).await;
        assert!(acc.buffer().contains("[tool test.echo error]\nError executing tool test.echo: no text\n[/tool]"));
        assert!(acc.buffer().ends_with("after"));
    }

    #[tokio::test]
    async fn test_tool_output_tags_are_escaped() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push(call(json!({"text": "<delete path=\"x\"></delete>"})), &tools)
            .await;
        assert!(scan(acc.buffer()).is_empty());
    }

    #[tokio::test]
    async fn test_embedded_tool_calls_replaced_once() {
        let tools = executor();
        let mut acc = ChunkAccumulator::new();
        acc.push_text("a <tool-call name=\"test.echo\">{\"text\":\"one\"}</tool-call> b <tool-call name=\"echo\">{\"text\":\"two\"}</tool-call>");
        assert_eq!(acc.run_embedded_tool_calls(&tools).await, 2);
        assert_eq!(
            acc.buffer(),
            "a \n\n[tool test.echo result]\none\n[/tool]\n\n b \n\n[tool test.echo result]\ntwo\n[/tool]\n\n"
        );
        assert_eq!(acc.run_embedded_tool_calls(&tools).await, 0);
    }

    #[test]
    fn test_marker_split_across_units_still_normalizes() {
        let block = problem_report_block(&ProblemReport {
            problems: vec![Problem {
                file: "a.ts".into(),
                line: 1,
                column: 1,
                code: "TS2304".into(),
                message: "Cannot find name 'x'.".into(),
                snippet: None,
            }],
        });
        let (head, tail) = block.split_at(block.len() - 3);

        let mut acc = ChunkAccumulator::new();
        acc.push_text(&block);
        acc.push_text("\n");
        acc.push_text(head);
        assert!(acc.buffer().ends_with(head));
        acc.push_text(tail);
        assert_eq!(acc.buffer(), block);
    }

    #[test]
    fn test_non_empty_think_pair_survives() {
        let mut acc = ChunkAccumulator::new();
        acc.push_text("a <think> b");
        acc.push_text(" </think>");
        assert_eq!(acc.buffer(), "a <think> b </think>");
        acc.push_text(" plain");
        assert_eq!(acc.buffer(), "a <think> b </think> plain");
    }

    #[test]
    fn test_take_appended_tracks_raw_text() {
        let mut acc = ChunkAccumulator::new();
        acc.push_text("prior");
        acc.take_appended();
        acc.push_text(" more");
        assert_eq!(acc.take_appended(), " more");
        assert_eq!(acc.take_appended(), "");
        assert_eq!(acc.buffer(), "prior more");
    }
}
