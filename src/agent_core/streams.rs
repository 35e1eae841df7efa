//! Per-conversation stream table.
//!
//! Holds the cancellation token of the running request for each
//! conversation and the short-lived partial-response cache. Each
//! registration gets a fresh generation number, so a superseded request can
//! tell it no longer owns the entry and must not touch it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// A request's claim on its conversation's entry.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub conversation_id: i64,
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Default)]
struct StreamTable {
    next_generation: u64,
    tokens: HashMap<i64, (u64, CancellationToken)>,
    partials: HashMap<i64, (u64, String)>,
}

/// Shared by every request of one orchestrator.
#[derive(Default)]
pub struct ActiveStreams {
    inner: Mutex<StreamTable>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, StreamTable> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new request for `conversation_id`.
    ///
    /// An existing entry is replaced but its token is not cancelled; the
    /// older request notices via [`is_current`](Self::is_current).
    pub fn register(&self, conversation_id: i64) -> StreamHandle {
        let mut table = self.table();
        table.next_generation += 1;
        let generation = table.next_generation;
        let token = CancellationToken::new();
        if table
            .tokens
            .insert(conversation_id, (generation, token.clone()))
            .is_some()
        {
            tracing::warn!(conversation_id, generation, "superseding an active stream");
        }
        StreamHandle {
            conversation_id,
            generation,
            token,
        }
    }

    /// Whether `handle` still owns its conversation's entry.
    pub fn is_current(&self, handle: &StreamHandle) -> bool {
        self.table()
            .tokens
            .get(&handle.conversation_id)
            .is_some_and(|(generation, _)| *generation == handle.generation)
    }

    pub fn is_active(&self, conversation_id: i64) -> bool {
        self.table().tokens.contains_key(&conversation_id)
    }

    /// Cancel the active request, if any. Returns whether one was found.
    pub fn cancel(&self, conversation_id: i64) -> bool {
        match self.table().tokens.get(&conversation_id) {
            Some((generation, token)) => {
                tracing::info!(conversation_id, generation, "cancelling stream");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the entry and cached partial if `handle` still owns them.
    pub fn release(&self, handle: &StreamHandle) {
        let mut table = self.table();
        if table
            .tokens
            .get(&handle.conversation_id)
            .is_some_and(|(generation, _)| *generation == handle.generation)
        {
            table.tokens.remove(&handle.conversation_id);
        }
        if table
            .partials
            .get(&handle.conversation_id)
            .is_some_and(|(generation, _)| *generation == handle.generation)
        {
            table.partials.remove(&handle.conversation_id);
        }
    }

    /// Cache the latest snapshot for `handle`'s conversation.
    pub fn set_partial(&self, handle: &StreamHandle, snapshot: &str) {
        let mut table = self.table();
        let owns = table
            .tokens
            .get(&handle.conversation_id)
            .is_some_and(|(generation, _)| *generation == handle.generation);
        if owns {
            table.partials.insert(
                handle.conversation_id,
                (handle.generation, snapshot.to_string()),
            );
        }
    }

    /// The cached snapshot written by `handle`, if any.
    pub fn partial(&self, handle: &StreamHandle) -> Option<String> {
        self.table()
            .partials
            .get(&handle.conversation_id)
            .filter(|(generation, _)| *generation == handle.generation)
            .map(|(_, snapshot)| snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_release() {
        let streams = ActiveStreams::new();
        let handle = streams.register(1);
        assert!(streams.is_active(1));
        assert!(streams.is_current(&handle));
        streams.release(&handle);
        assert!(!streams.is_active(1));
    }

    #[test]
    fn test_supersede_keeps_new_entry() {
        let streams = ActiveStreams::new();
        let old = streams.register(1);
        let new = streams.register(1);
        assert!(!streams.is_current(&old));
        assert!(streams.is_current(&new));
        assert!(!old.token.is_cancelled());

        streams.release(&old);
        assert!(streams.is_active(1), "old release must not drop new entry");
        streams.release(&new);
        assert!(!streams.is_active(1));
    }

    #[test]
    fn test_cancel_without_stream_is_ack() {
        let streams = ActiveStreams::new();
        assert!(!streams.cancel(99));
    }

    #[test]
    fn test_cancel_trips_token() {
        let streams = ActiveStreams::new();
        let handle = streams.register(3);
        assert!(streams.cancel(3));
        assert!(handle.token.is_cancelled());
    }

    #[test]
    fn test_partial_cache_is_owned_by_generation() {
        let streams = ActiveStreams::new();
        let old = streams.register(1);
        streams.set_partial(&old, "old text");
        let new = streams.register(1);
        streams.set_partial(&old, "stale");
        assert_eq!(streams.partial(&old).as_deref(), Some("old text"));
        assert_eq!(streams.partial(&new), None);

        streams.set_partial(&new, "new text");
        streams.release(&old);
        assert_eq!(streams.partial(&new).as_deref(), Some("new text"));
        streams.release(&new);
        assert_eq!(streams.partial(&new), None);
    }
}
