//! SQLite persistence for conversations and messages.
//!
//! Uses `rusqlite` in synchronous mode; calls are short and happen between
//! stream units. WAL mode is enabled for concurrent reads during streaming.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::types::{Conversation, Message};
use crate::inference::types::Role;

/// What the orchestrator needs from persistence.
pub trait ChatStore: Send + Sync {
    fn create_conversation(&self, title: Option<&str>) -> Result<Conversation, AgentError>;

    fn get_conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError>;

    fn insert_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<Message, AgentError>;

    fn update_message_content(&self, message_id: i64, content: &str) -> Result<(), AgentError>;

    /// Messages of a conversation, oldest first.
    fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>, AgentError>;
}

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite-backed [`ChatStore`].
pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

impl SqliteChatStore {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|_| AgentError::DatabaseError {
            reason: "connection mutex poisoned".into(),
        })
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);
            ",
        )?;
        Ok(())
    }
}

impl ChatStore for SqliteChatStore {
    fn create_conversation(&self, title: Option<&str>) -> Result<Conversation, AgentError> {
        let created_at = now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations (title, created_at) VALUES (?1, ?2)",
            params![title, created_at],
        )?;
        Ok(Conversation {
            id: conn.last_insert_rowid(),
            title: title.map(str::to_string),
            created_at,
        })
    }

    fn get_conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError> {
        self.lock()?
            .query_row(
                "SELECT id, title, created_at FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(AgentError::ConversationNotFound { conversation_id })
    }

    fn insert_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<Message, AgentError> {
        let created_at = now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, role_to_str(role), content, created_at],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AgentError::ConversationNotFound { conversation_id }
            }
            other => other.into(),
        })?;
        Ok(Message {
            id: conn.last_insert_rowid(),
            conversation_id,
            role,
            content: content.to_string(),
            created_at,
        })
    }

    fn update_message_content(&self, message_id: i64, content: &str) -> Result<(), AgentError> {
        let updated = self.lock()?.execute(
            "UPDATE messages SET content = ?2 WHERE id = ?1",
            params![message_id, content],
        )?;
        if updated == 0 {
            return Err(AgentError::MessageNotFound { message_id });
        }
        Ok(())
    }

    fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>, AgentError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: str_to_role(&row.get::<_, String>(2)?),
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn str_to_role(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> SqliteChatStore {
        SqliteChatStore::open(":memory:").unwrap()
    }

    #[test]
    fn test_create_and_get_conversation() {
        let db = test_db();
        let conv = db.create_conversation(Some("first")).unwrap();
        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded, conv);
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.created_at).is_ok());
    }

    #[test]
    fn test_get_missing_conversation() {
        let err = test_db().get_conversation(42).unwrap_err();
        assert!(matches!(
            err,
            AgentError::ConversationNotFound {
                conversation_id: 42
            }
        ));
    }

    #[test]
    fn test_insert_update_list_messages() {
        let db = test_db();
        let conv = db.create_conversation(None).unwrap();
        let user = db.insert_message(conv.id, Role::User, "hello").unwrap();
        let assistant = db.insert_message(conv.id, Role::Assistant, "").unwrap();
        db.update_message_content(assistant.id, "hi there").unwrap();

        let messages = db.list_messages(conv.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, user.id);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hi there");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_insert_into_missing_conversation_fails() {
        let err = test_db()
            .insert_message(999, Role::User, "orphan")
            .unwrap_err();
        assert!(matches!(err, AgentError::ConversationNotFound { .. }));
    }

    #[test]
    fn test_update_missing_message() {
        let err = test_db().update_message_content(5, "x").unwrap_err();
        assert!(matches!(err, AgentError::MessageNotFound { message_id: 5 }));
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(str_to_role(role_to_str(role)), role);
        }
    }
}
