//! Continuation controller.
//!
//! A `<write>` that opens but never closes in the final buffer is a
//! truncated generation. The controller re-invokes the model with the
//! buffer seeded as the assistant's own turn so it can finish the
//! directive, up to a fixed number of attempts.

use super::tags::has_unclosed_write;
use crate::inference::types::{ChatMessage, ModelRequest};

/// Default number of extra model calls spent on one truncated write.
pub const DEFAULT_MAX_CONTINUATIONS: u32 = 2;

#[derive(Debug, Clone)]
pub struct ContinuationController {
    max_attempts: u32,
    attempts: u32,
}

impl ContinuationController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether another continuation call should be made for `buffer`.
    pub fn should_continue(&self, buffer: &str) -> bool {
        !self.budget_exhausted() && has_unclosed_write(buffer)
    }

    /// Build the next continuation request and count the attempt.
    pub fn next_request(&mut self, base: &ModelRequest, buffer: &str) -> ModelRequest {
        self.attempts += 1;
        let mut messages = base.messages.clone();
        messages.push(ChatMessage::assistant(buffer));
        ModelRequest {
            system_prompt: base.system_prompt.clone(),
            messages,
            tools: None,
        }
    }
}

impl Default for ContinuationController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTINUATIONS)
    }
}
