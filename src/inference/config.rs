//! Model configuration loading and validation.
//!
//! Reads `_models/config.yaml` and resolves environment variables.
//! Config is the single source of truth for model endpoints and the
//! fallback chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// Env var pointing at a directory that contains `_models/config.yaml`.
pub const PROJECT_ROOT_ENV: &str = "PAIRFLOW_PROJECT_ROOT";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model's endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Model identifier sent in the request body. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Bearer token. Usually `${SOME_API_KEY}` in the YAML.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_context_window() -> u32 {
    32_768
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    8192
}

/// Top-level model registry (mirrors `_models/config.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// Ordered candidate list: the active model, then every fallback-chain
    /// entry that exists in `models`, without duplicates.
    pub fn candidates(&self) -> Vec<(String, ModelConfig)> {
        let mut out: Vec<(String, ModelConfig)> = Vec::new();
        let keys = std::iter::once(&self.active_model).chain(self.fallback_chain.iter());
        for key in keys {
            if out.iter().any(|(k, _)| k == key) {
                continue;
            }
            if let Some(model) = self.models.get(key) {
                out.push((key.clone(), model.clone()));
            }
        }
        out
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Checks `PAIRFLOW_PROJECT_ROOT` first, then searches upward from `start`
/// for `_models/config.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(root) = std::env::var(PROJECT_ROOT_ENV) {
        let candidate = PathBuf::from(&root).join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: "could not find _models/config.yaml".into(),
    })
}

/// Load and parse the models configuration file.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_models_config(&raw)
}

/// Parse config YAML after env interpolation.
pub fn parse_models_config(raw: &str) -> Result<ModelsConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    if config.candidates().is_empty() {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        });
    }

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
