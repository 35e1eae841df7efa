//! Auto-fix controller.
//!
//! After continuation settles, the proposed changes are checked against a
//! virtual overlay. Each round with problems becomes a fix prompt; the
//! model's replies and the prompts that produced them are kept as turns so
//! later rounds see every earlier attempt.

use super::prompts::fix_prompt;
use super::tags::dependency_packages;
use super::types::{ChatMode, ProblemReport};
use crate::inference::types::{ChatMessage, ModelRequest};

pub const DEFAULT_MAX_AUTO_FIX_ATTEMPTS: u32 = 2;

/// Why the fix loop did not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    Disabled,
    AskMode,
    PendingDependencies(Vec<String>),
}

/// Decide whether diagnostics should run for `buffer` at all.
///
/// Pending dependency installs are skipped because missing packages would
/// show up as type errors the model cannot fix.
pub fn eligibility(enabled: bool, mode: ChatMode, buffer: &str) -> Result<(), Skip> {
    if !enabled {
        return Err(Skip::Disabled);
    }
    if mode == ChatMode::Ask {
        return Err(Skip::AskMode);
    }
    let packages = dependency_packages(buffer);
    if !packages.is_empty() {
        return Err(Skip::PendingDependencies(packages));
    }
    Ok(())
}

#[derive(Debug)]
pub struct AutoFixController {
    max_attempts: u32,
    attempts: u32,
    /// Assistant reply as it stood when fixing began.
    original_reply: String,
    /// Alternating fix prompts and replies from earlier rounds.
    history: Vec<ChatMessage>,
}

impl AutoFixController {
    pub fn new(max_attempts: u32, original_reply: impl Into<String>) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            original_reply: original_reply.into(),
            history: Vec::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn should_fix(&self, report: &ProblemReport) -> bool {
        !report.is_empty() && self.attempts < self.max_attempts
    }

    /// Build the request for the next fix round and count the attempt.
    pub fn next_request(&mut self, base: &ModelRequest, report: &ProblemReport) -> ModelRequest {
        self.attempts += 1;
        let prompt = fix_prompt(report);

        let mut messages = base.messages.clone();
        messages.push(ChatMessage::assistant(self.original_reply.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(prompt.clone()));

        self.history.push(ChatMessage::user(prompt));
        ModelRequest {
            system_prompt: base.system_prompt.clone(),
            messages,
            tools: base.tools.clone(),
        }
    }

    /// Record the model's reply to the latest fix prompt.
    pub fn record_reply(&mut self, reply: impl Into<String>) {
        self.history.push(ChatMessage::assistant(reply));
    }
}
