//! Shared types for the agent core.
//!
//! Persisted conversation records, request inputs, diagnostics reports and
//! the events pushed to the UI.

use serde::{Deserialize, Serialize};

use crate::inference::types::Role;

// ─── Conversations ──────────────────────────────────────────────────────────

/// A conversation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub title: Option<String>,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A single stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Auto-incremented row ID (set by DB on insert).
    pub id: i64,
    pub conversation_id: i64,
    /// `user` or `assistant`.
    pub role: Role,
    pub content: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A text attachment sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

/// Whether the assistant may propose file changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Full directive vocabulary; auto-fix and auto-apply allowed.
    #[default]
    Build,
    /// Read-only question answering.
    Ask,
}

// ─── Diagnostics ────────────────────────────────────────────────────────────

/// One static-analysis finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: String,
    pub message: String,
    /// Source excerpt around the finding, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// The result of one diagnostics pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub problems: Vec<Problem>,
}

impl ProblemReport {
    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }
}

// ─── UI events ──────────────────────────────────────────────────────────────

/// One-way messages pushed to the UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// The full message list with the in-progress assistant content.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        conversation_id: i64,
        messages: Vec<Message>,
    },
    /// Terminal failure of the request.
    #[serde(rename_all = "camelCase")]
    Error { conversation_id: i64, error: String },
    /// The request reached a terminal state.
    #[serde(rename_all = "camelCase")]
    End {
        conversation_id: i64,
        updated_files: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra_files: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra_files_error: Option<String>,
    },
}

impl ChatEvent {
    pub fn conversation_id(&self) -> i64 {
        match self {
            ChatEvent::Snapshot {
                conversation_id, ..
            }
            | ChatEvent::Error {
                conversation_id, ..
            }
            | ChatEvent::End {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_event_serializes_camel_case_and_omits_none() {
        let event = ChatEvent::End {
            conversation_id: 7,
            updated_files: true,
            extra_files: None,
            extra_files_error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "end");
        assert_eq!(json["conversationId"], 7);
        assert_eq!(json["updatedFiles"], true);
        assert!(json.get("extraFiles").is_none());
    }

    #[test]
    fn test_snapshot_event_shape() {
        let event = ChatEvent::Snapshot {
            conversation_id: 1,
            messages: vec![Message {
                id: 3,
                conversation_id: 1,
                role: Role::Assistant,
                content: "hi".into(),
                created_at: "2024-01-01T00:00:00+00:00".into(),
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["messages"][0]["role"], "assistant");
        assert_eq!(json["messages"][0]["conversationId"], 1);
        assert_eq!(event.conversation_id(), 1);
    }

    #[test]
    fn test_chat_mode_default_is_build() {
        assert_eq!(ChatMode::default(), ChatMode::Build);
        let mode: ChatMode = serde_json::from_str("\"ask\"").unwrap();
        assert_eq!(mode, ChatMode::Ask);
    }
}
