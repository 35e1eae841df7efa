//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads an HTTP body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and turns deltas into typed
//! [`StreamUnit`]s. Tool-call fragments are accumulated across deltas and
//! emitted as one unit per call once the model signals completion.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, StreamUnit, ToolCall};

// ─── SSE line parser ─────────────────────────────────────────────────────────

/// Parse raw SSE bytes into `StreamUnit`s.
///
/// Bytes are buffered until a full event (`\n\n`) is available, so multi-byte
/// UTF-8 sequences split across network chunks decode correctly.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<StreamUnit, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let reader = SseReader {
        byte_stream,
        state: StreamState::default(),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(unit) = reader.ready.pop_front() {
                return Some((Ok(unit), reader));
            }
            if reader.finished {
                return None;
            }

            if let Some(event_end) = find_event_boundary(&reader.buffer) {
                let event: Vec<u8> = reader.buffer.drain(..event_end + 2).collect();
                let event = String::from_utf8_lossy(&event[..event_end]).into_owned();
                if let Err(e) = reader.handle_event(&event) {
                    reader.finished = true;
                    return Some((Err(e), reader));
                }
                continue;
            }

            match reader.byte_stream.next().await {
                Some(Ok(bytes)) => {
                    reader
                        .buffer
                        .extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((
                        Err(InferenceError::StreamError {
                            reason: format!("stream read error: {e}"),
                        }),
                        reader,
                    ));
                }
                None => {
                    // Body ended without [DONE]; flush what is left.
                    let rest = std::mem::take(&mut reader.buffer);
                    let rest = String::from_utf8_lossy(&rest).into_owned();
                    if !rest.trim().is_empty() {
                        if let Err(e) = reader.handle_event(rest.trim()) {
                            reader.finished = true;
                            return Some((Err(e), reader));
                        }
                    }
                    reader.ready.extend(reader.state.finalize_tool_calls());
                    reader.finished = true;
                }
            }
        }
    })
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

struct SseReader<S> {
    byte_stream: S,
    state: StreamState,
    buffer: Vec<u8>,
    ready: VecDeque<StreamUnit>,
    finished: bool,
}

impl<S> SseReader<S> {
    fn handle_event(&mut self, event: &str) -> Result<(), InferenceError> {
        let outcome = self.state.process_event(event)?;
        self.ready.extend(outcome.units);
        if outcome.done {
            self.finished = true;
        }
        Ok(())
    }
}

// ─── Stream State ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct EventOutcome {
    units: Vec<StreamUnit>,
    done: bool,
}

/// Mutable state for accumulating tool call fragments across SSE events.
#[derive(Debug, Default)]
struct StreamState {
    /// In-progress tool calls: `(index, id, name, arguments_buffer)`.
    pending_tool_calls: Vec<(u32, Option<String>, String, String)>,
}

impl StreamState {
    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<EventOutcome, InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(EventOutcome {
                        units: self.finalize_tool_calls(),
                        done: true,
                    });
                }
                data_content.push_str(data);
            }
            // Comments, `event:` and `id:` lines are ignored.
        }

        if data_content.is_empty() {
            return Ok(EventOutcome::default());
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        Ok(EventOutcome {
            units: self.process_chunk(chunk),
            done: false,
        })
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamUnit> {
        let mut units = Vec::new();
        let choice = match chunk.choices.into_iter().next() {
            Some(c) => c,
            None => return units,
        };

        // Reasoning models stream chain-of-thought before the answer, so a
        // delta carrying both is emitted reasoning-first.
        if let Some(reasoning) = choice.delta.reasoning.filter(|r| !r.is_empty()) {
            units.push(StreamUnit::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            units.push(StreamUnit::Text(content));
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let (name_part, args_part) = match tc.function {
                    Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                    None => (String::new(), String::new()),
                };

                match self
                    .pending_tool_calls
                    .iter_mut()
                    .find(|(idx, _, _, _)| *idx == index)
                {
                    Some((_, id, name, args)) => {
                        name.push_str(&name_part);
                        args.push_str(&args_part);
                        if tc.id.is_some() {
                            *id = tc.id;
                        }
                    }
                    None => self
                        .pending_tool_calls
                        .push((index, tc.id, name_part, args_part)),
                }
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            units.extend(self.finalize_tool_calls());
        }

        units
    }

    /// Drain accumulated tool calls into units, in index order.
    fn finalize_tool_calls(&mut self) -> Vec<StreamUnit> {
        let mut pending = std::mem::take(&mut self.pending_tool_calls);
        pending.sort_by_key(|(index, _, _, _)| *index);
        pending
            .into_iter()
            .filter(|(_, _, name, _)| !name.is_empty())
            .map(|(_, id, name, args)| {
                StreamUnit::ToolCall(ToolCall {
                    id: id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
                    name,
                    arguments: parse_arguments(&args),
                })
            })
            .collect()
    }
}

/// Parse accumulated argument text. Empty means `{}`; text that isn't JSON
/// is passed through as a string so the tool can report it.
fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
