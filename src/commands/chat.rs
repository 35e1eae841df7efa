//! IPC commands for the chat interface.
//!
//! Thin wrappers that bridge the frontend to the stream orchestrator and the
//! chat store. Progress is delivered through the orchestrator's event sink,
//! not through return values.

use serde::Deserialize;

use crate::agent_core::{Attachment, ChatMode, Conversation, Message, StreamRequest};
use crate::AppState;

/// Arguments of `chat_stream`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamParams {
    pub conversation_id: i64,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub mode: Option<ChatMode>,
}

/// Stream a reply into `conversation_id`. Resolves when the request ends.
pub async fn chat_stream(state: &AppState, params: ChatStreamParams) -> Result<i64, String> {
    let request = StreamRequest {
        conversation_id: params.conversation_id,
        prompt: params.prompt,
        attachments: params.attachments,
        mode: params.mode,
    };
    state
        .orchestrator
        .start_stream(request)
        .await
        .map_err(|e| format!("Chat stream failed: {e}"))
}

/// Cancel the active stream for a conversation. Always acknowledges.
pub fn chat_cancel(state: &AppState, conversation_id: i64) -> bool {
    let found = state.orchestrator.cancel_stream(conversation_id);
    tracing::info!(conversation_id, found, "chat_cancel");
    true
}

pub fn create_conversation(state: &AppState, title: Option<String>) -> Result<Conversation, String> {
    state
        .store
        .create_conversation(title.as_deref())
        .map_err(|e| format!("Failed to create conversation: {e}"))
}

pub fn list_messages(state: &AppState, conversation_id: i64) -> Result<Vec<Message>, String> {
    state
        .store
        .list_messages(conversation_id)
        .map_err(|e| format!("Failed to list messages: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::testing::{text, Harness, Reply};
    use crate::commands::settings::ChatSettings;
    use crate::TokioMutex;

    fn state(h: &Harness) -> AppState {
        AppState {
            orchestrator: h.orchestrator.clone(),
            store: h.store.clone(),
            settings: TokioMutex::new(ChatSettings::default()),
        }
    }

    #[test]
    fn test_params_from_frontend_json() {
        let params: ChatStreamParams = serde_json::from_str(
            r#"{"conversationId": 3, "prompt": "hi", "mode": "ask",
                "attachments": [{"name": "a.txt", "content": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(params.conversation_id, 3);
        assert_eq!(params.mode, Some(ChatMode::Ask));
        assert_eq!(params.attachments.len(), 1);

        let minimal: ChatStreamParams =
            serde_json::from_str(r#"{"conversationId": 1, "prompt": "hi"}"#).unwrap();
        assert!(minimal.attachments.is_empty());
        assert_eq!(minimal.mode, None);
    }

    #[tokio::test]
    async fn test_stream_into_new_conversation() {
        let h = Harness::new(vec![Reply::Units(vec![text("hello")])], vec![]);
        let state = state(&h);

        let conversation = create_conversation(&state, Some("new".into())).unwrap();
        let id = chat_stream(
            &state,
            ChatStreamParams {
                conversation_id: conversation.id,
                prompt: "hi".into(),
                attachments: Vec::new(),
                mode: None,
            },
        )
        .await
        .unwrap();

        let messages = list_messages(&state, id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_stream_error_is_a_string() {
        let h = Harness::new(vec![], vec![]);
        let err = chat_stream(
            &state(&h),
            ChatStreamParams {
                conversation_id: 404,
                prompt: "hi".into(),
                attachments: Vec::new(),
                mode: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.starts_with("Chat stream failed: "));
    }

    #[test]
    fn test_cancel_always_acks() {
        let h = Harness::new(vec![], vec![]);
        assert!(chat_cancel(&state(&h), 12));
    }
}
