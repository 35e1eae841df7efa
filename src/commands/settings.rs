//! IPC commands for the chat settings panel.
//!
//! Settings are persisted to `chat_settings.json` in the app data directory
//! and pushed into the running orchestrator on save. Tool limits and the
//! diagnostics command are read once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_core::context::ContextLimits;
use crate::agent_core::diagnostics::DiagnosticsCommand;
use crate::agent_core::tool_executor::{DEFAULT_MAX_RESULT_CHARS, DEFAULT_TOOL_TIMEOUT};
use crate::agent_core::{ChatMode, OrchestratorSettings};
use crate::AppState;

/// User-facing chat behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub chat_mode: ChatMode,
    /// Run diagnostics on proposed changes and ask the model to fix them.
    pub auto_fix_problems: bool,
    /// Write completed directives to disk when a response finishes.
    pub auto_apply_changes: bool,
    pub max_continuation_attempts: u32,
    pub max_auto_fix_attempts: u32,
    pub tool_timeout_secs: u64,
    pub max_tool_result_chars: usize,
    /// Alias → canonical tool name.
    pub tool_aliases: HashMap<String, String>,
    pub context_max_files: usize,
    pub context_max_bytes: usize,
    /// Static checker; no diagnostics when unset.
    pub diagnostics: Option<DiagnosticsCommand>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        let orchestrator = OrchestratorSettings::default();
        Self {
            chat_mode: orchestrator.chat_mode,
            auto_fix_problems: orchestrator.auto_fix_problems,
            auto_apply_changes: orchestrator.auto_apply_changes,
            max_continuation_attempts: orchestrator.max_continuation_attempts,
            max_auto_fix_attempts: orchestrator.max_auto_fix_attempts,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT.as_secs(),
            max_tool_result_chars: DEFAULT_MAX_RESULT_CHARS,
            tool_aliases: HashMap::new(),
            context_max_files: orchestrator.context.max_files,
            context_max_bytes: orchestrator.context.max_bytes,
            diagnostics: None,
        }
    }
}

impl From<&ChatSettings> for OrchestratorSettings {
    fn from(s: &ChatSettings) -> Self {
        Self {
            chat_mode: s.chat_mode,
            auto_fix_problems: s.auto_fix_problems,
            auto_apply_changes: s.auto_apply_changes,
            max_continuation_attempts: s.max_continuation_attempts,
            max_auto_fix_attempts: s.max_auto_fix_attempts,
            context: ContextLimits {
                max_files: s.context_max_files,
                max_bytes: s.context_max_bytes,
            },
        }
    }
}

impl ChatSettings {
    /// Load from the app data directory or return defaults.
    pub fn load_or_default() -> Self {
        Self::load_from(&Self::persist_path())
    }

    /// Load from `path`; missing or unreadable files give defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "loaded chat settings");
                    settings
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse chat settings, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read chat settings, using defaults");
                Self::default()
            }
        }
    }

    /// Save to the app data directory.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::persist_path())
    }

    /// Save to `path` (atomic write).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), "saved chat settings");
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    fn persist_path() -> PathBuf {
        crate::data_dir().join("chat_settings.json")
    }
}

/// Get the current chat settings.
pub async fn get_chat_settings(state: &AppState) -> Result<ChatSettings, String> {
    Ok(state.settings.lock().await.clone())
}

/// Replace the chat settings, persist them, and apply them to new requests.
pub async fn save_chat_settings(
    settings: ChatSettings,
    state: &AppState,
) -> Result<ChatSettings, String> {
    let mut current = state.settings.lock().await;
    settings
        .save()
        .map_err(|e| format!("Failed to save settings: {e}"))?;
    state
        .orchestrator
        .update_settings(OrchestratorSettings::from(&settings));
    tracing::info!(
        mode = ?settings.chat_mode,
        auto_fix = settings.auto_fix_problems,
        auto_apply = settings.auto_apply_changes,
        "chat settings updated"
    );
    *current = settings;
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = ChatSettings::default();
        assert_eq!(s.chat_mode, ChatMode::Build);
        assert!(s.auto_fix_problems);
        assert!(!s.auto_apply_changes);
        assert_eq!(s.max_continuation_attempts, 2);
        assert_eq!(s.max_auto_fix_attempts, 2);
        assert_eq!(s.tool_timeout(), Duration::from_secs(30));
        assert_eq!(s.max_tool_result_chars, 10_000);
        assert!(s.diagnostics.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/chat_settings.json");
        let mut settings = ChatSettings {
            chat_mode: ChatMode::Ask,
            auto_apply_changes: true,
            diagnostics: Some(DiagnosticsCommand {
                program: "npx".into(),
                args: vec!["tsc".into(), "--noEmit".into()],
                timeout_secs: 60,
            }),
            ..ChatSettings::default()
        };
        settings
            .tool_aliases
            .insert("web-search".into(), "search.web_search".into());

        settings.save_to(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(ChatSettings::load_from(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_settings.json");
        std::fs::write(&path, r#"{"chatMode": "ask", "maxAutoFixAttempts": 1}"#).unwrap();

        let loaded = ChatSettings::load_from(&path);
        assert_eq!(loaded.chat_mode, ChatMode::Ask);
        assert_eq!(loaded.max_auto_fix_attempts, 1);
        assert_eq!(loaded.max_continuation_attempts, 2);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(ChatSettings::load_from(&path), ChatSettings::default());
        assert_eq!(
            ChatSettings::load_from(&dir.path().join("missing.json")),
            ChatSettings::default()
        );
    }

    #[test]
    fn test_orchestrator_settings_from() {
        let settings = ChatSettings {
            auto_fix_problems: false,
            context_max_files: 7,
            ..ChatSettings::default()
        };
        let o = OrchestratorSettings::from(&settings);
        assert!(!o.auto_fix_problems);
        assert_eq!(o.context.max_files, 7);
    }
}
