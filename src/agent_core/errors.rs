//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Conversation not found.
    #[error("conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: i64 },

    /// Message not found.
    #[error("message not found: {message_id}")]
    MessageNotFound { message_id: i64 },

    /// The primary model invocation failed.
    #[error("model invocation failed: {0}")]
    Model(#[from] InferenceError),

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_wraps_inference_error() {
        let err: AgentError = InferenceError::HttpError {
            status: 401,
            body: "unauthorized".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "model invocation failed: HTTP 401: unauthorized"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let err: AgentError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, AgentError::SerializationError { .. }));
    }
}
