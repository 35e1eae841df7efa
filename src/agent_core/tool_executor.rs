//! Tool registry and executor.
//!
//! Tools are registered under fully-qualified `server.tool` names. The
//! executor resolves whatever name the model produced, runs the tool under
//! a wall-clock timeout, and always returns text: a failure becomes an
//! error outcome, never an `Err` that could abort the stream.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use crate::inference::types::{FunctionDefinition, ToolDefinition};

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on result text, in characters.
pub const DEFAULT_MAX_RESULT_CHARS: usize = 10_000;

/// Minimum similarity for "did you mean" suggestions.
const SUGGESTION_MIN_SIMILARITY: f64 = 0.4;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors raised by tool implementations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("path escapes the project root: {path}")]
    PathOutsideProject { path: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("{reason}")]
    Failed { reason: String },
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io {
            reason: e.to_string(),
        }
    }
}

// ─── Tool trait ─────────────────────────────────────────────────────────────

/// An executable capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Fully-qualified name, e.g. `project.read_file`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> serde_json::Value;

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Outcome of resolving a model-supplied tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResolution {
    Exact(String),
    /// Matched through the configured alias table.
    Aliased { resolved: String, original: String },
    /// Matched after ignoring case and treating `-` and `_` as equal.
    Normalized { resolved: String, original: String },
    /// Bare tool name matched a unique `*.name`.
    Unprefixed { resolved: String, original: String },
    NotFound {
        original: String,
        suggestions: Vec<String>,
    },
}

impl ToolResolution {
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            Self::Exact(name) => Some(name),
            Self::Aliased { resolved, .. }
            | Self::Normalized { resolved, .. }
            | Self::Unprefixed { resolved, .. } => Some(resolved),
            Self::NotFound { .. } => None,
        }
    }
}

/// Canonical tool name → implementation. Read-only once built.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// alias → canonical name.
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn set_aliases(&mut self, aliases: HashMap<String, String>) {
        self.aliases = aliases;
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// OpenAI function-calling definitions, sorted by name.
    pub fn to_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }

    /// Resolve a model-supplied name to a registered tool.
    ///
    /// Order: exact, alias table, case/separator-insensitive, unique
    /// unprefixed suffix. Anything else is `NotFound` with suggestions.
    pub fn resolve(&self, name: &str) -> ToolResolution {
        let name = name.trim();

        // 1. Exact match
        if self.tools.contains_key(name) {
            return ToolResolution::Exact(name.to_string());
        }

        // 2. Alias table
        if let Some(target) = self.aliases.get(name) {
            if self.tools.contains_key(target) {
                return ToolResolution::Aliased {
                    resolved: target.clone(),
                    original: name.to_string(),
                };
            }
            tracing::warn!(alias = %name, target = %target, "tool alias points at unknown tool");
        }

        // 3. Case and separator aliasing (`web-search` vs `web_search`)
        let folded = fold_name(name);
        let folded_matches: Vec<&String> = self
            .tools
            .keys()
            .filter(|k| fold_name(k) == folded)
            .collect();
        if folded_matches.len() == 1 {
            return ToolResolution::Normalized {
                resolved: folded_matches[0].clone(),
                original: name.to_string(),
            };
        }

        // 4. Unprefixed (no dot): search for a unique `*.{name}`
        if !name.contains('.') {
            let suffix = format!(".{folded}");
            let candidates: Vec<&String> = self
                .tools
                .keys()
                .filter(|fq| fold_name(fq).ends_with(&suffix))
                .collect();
            match candidates.len() {
                1 => {
                    return ToolResolution::Unprefixed {
                        resolved: candidates[0].clone(),
                        original: name.to_string(),
                    }
                }
                0 => {}
                _ => {
                    let mut suggestions: Vec<String> =
                        candidates.into_iter().cloned().collect();
                    suggestions.sort_unstable();
                    return ToolResolution::NotFound {
                        original: name.to_string(),
                        suggestions,
                    };
                }
            }
        }

        ToolResolution::NotFound {
            original: name.to_string(),
            suggestions: self.find_similar(name, 3),
        }
    }

    /// Up to `max_results` registered names closest to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let folded = fold_name(name);
        let mut scored: Vec<(&String, f64)> = self
            .tools
            .keys()
            .map(|k| (k, similarity(&folded, &fold_name(k))))
            .filter(|(_, score)| *score >= SUGGESTION_MIN_SIMILARITY)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        scored
            .into_iter()
            .take(max_results)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

fn fold_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

/// Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let m = a_bytes.len();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a_bytes[i - 1] != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity in `[0, 1]`.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Executor ───────────────────────────────────────────────────────────────

/// Text produced by one tool invocation, ready to splice into the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Canonical name when resolved, otherwise the name as requested.
    pub tool_name: String,
    pub text: String,
    pub is_error: bool,
}

/// Runs tools from a shared registry with a timeout and result cap.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_result_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TOOL_TIMEOUT,
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = max;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Resolve and run `raw_name`. Never fails; errors come back as text.
    pub async fn execute(&self, raw_name: &str, args: serde_json::Value) -> ToolOutcome {
        let resolution = self.registry.resolve(raw_name);
        let (name, tool) = match resolution
            .resolved_name()
            .and_then(|n| self.registry.get(n).map(|t| (n.to_string(), t.clone())))
        {
            Some(found) => found,
            None => {
                let suggestions = match &resolution {
                    ToolResolution::NotFound { suggestions, .. } => suggestions.clone(),
                    _ => Vec::new(),
                };
                tracing::warn!(tool = %raw_name, ?suggestions, "tool not found");
                let mut text = format!("Tool not found: {raw_name}");
                if !suggestions.is_empty() {
                    text.push_str(&format!(". Did you mean: {}?", suggestions.join(", ")));
                }
                return ToolOutcome {
                    tool_name: raw_name.to_string(),
                    text,
                    is_error: true,
                };
            }
        };

        if name != raw_name {
            tracing::info!(requested = %raw_name, resolved = %name, "tool name resolved");
        }

        let started = std::time::Instant::now();
        let call = AssertUnwindSafe(tool.call(args)).catch_unwind();
        let result = tokio::time::timeout(self.timeout, call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (text, is_error) = match result {
            Ok(Ok(Ok(value))) => (stringify(&value), false),
            Ok(Ok(Err(e))) => (format!("Error executing tool {name}: {e}"), true),
            Ok(Err(panic)) => (
                format!("Error executing tool {name}: {}", panic_message(panic.as_ref())),
                true,
            ),
            Err(_) => (
                format!(
                    "Error executing tool {name}: timed out after {}s",
                    self.timeout.as_secs()
                ),
                true,
            ),
        };

        let text = self.truncate(&text, &name);
        if is_error {
            tracing::warn!(tool = %name, elapsed_ms, error = %text, "tool execution failed");
        } else {
            tracing::info!(tool = %name, elapsed_ms, result_len = text.len(), "tool executed");
        }

        ToolOutcome {
            tool_name: name,
            text,
            is_error,
        }
    }

    /// Cap a result at `max_result_chars` characters.
    fn truncate(&self, result: &str, tool_name: &str) -> String {
        let total = result.chars().count();
        if total <= self.max_result_chars {
            return result.to_string();
        }
        let cut = result
            .char_indices()
            .nth(self.max_result_chars)
            .map(|(i, _)| i)
            .unwrap_or(result.len());
        tracing::warn!(
            tool = %tool_name,
            original_len = total,
            truncated_to = self.max_result_chars,
            "tool result truncated"
        );
        format!(
            "{}\n\n[... truncated: showing first {} of {total} chars]",
            &result[..cut],
            self.max_result_chars
        )
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("tool panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("tool panicked: {s}")
    } else {
        "tool panicked".to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    enum Behavior {
        Echo,
        Fail,
        Sleep(Duration),
        Panic,
        Big(usize),
        FailBig(usize),
    }

    struct FakeTool {
        name: String,
        behavior: Behavior,
    }

    fn fake(name: &str, behavior: Behavior) -> Arc<dyn Tool> {
        Arc::new(FakeTool {
            name: name.to_string(),
            behavior,
        })
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            match self.behavior {
                Behavior::Echo => Ok(args),
                Behavior::Fail => Err(ToolError::Failed {
                    reason: "boom".into(),
                }),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(json!("late"))
                }
                Behavior::Panic => panic!("kaboom"),
                Behavior::Big(n) => Ok(json!("é".repeat(n))),
                Behavior::FailBig(n) => Err(ToolError::Failed {
                    reason: "x".repeat(n),
                }),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(fake("project.read_file", Behavior::Echo));
        reg.register(fake("project.list_directory", Behavior::Echo));
        reg.register(fake("web.web_search", Behavior::Echo));
        reg.register(fake("a.search", Behavior::Echo));
        reg.register(fake("b.search", Behavior::Echo));
        reg
    }

    #[test]
    fn test_resolve_exact() {
        assert_eq!(
            registry().resolve("project.read_file"),
            ToolResolution::Exact("project.read_file".into())
        );
    }

    #[test]
    fn test_resolve_alias_table() {
        let mut reg = registry();
        reg.set_aliases(HashMap::from([(
            "brave_search".to_string(),
            "web.web_search".to_string(),
        )]));
        assert_eq!(
            reg.resolve("brave_search").resolved_name(),
            Some("web.web_search")
        );
    }

    #[test]
    fn test_resolve_separator_and_case_variant() {
        let res = registry().resolve("Web.Web-Search");
        assert_eq!(
            res,
            ToolResolution::Normalized {
                resolved: "web.web_search".into(),
                original: "Web.Web-Search".into()
            }
        );
    }

    #[test]
    fn test_resolve_unprefixed_unique() {
        assert_eq!(
            registry().resolve("read-file").resolved_name(),
            Some("project.read_file")
        );
    }

    #[test]
    fn test_resolve_unprefixed_ambiguous() {
        match registry().resolve("search") {
            ToolResolution::NotFound { suggestions, .. } => {
                assert_eq!(suggestions, vec!["a.search", "b.search"]);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_not_found_suggests() {
        match registry().resolve("project.read_fil") {
            ToolResolution::NotFound { suggestions, .. } => {
                assert_eq!(suggestions.first().map(String::as_str), Some("project.read_file"));
                assert!(suggestions.len() <= 3);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_levenshtein_basic() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[tokio::test]
    async fn test_execute_success_stringifies_json() {
        let exec = ToolExecutor::new(Arc::new(registry()));
        let outcome = exec
            .execute("project.read_file", json!({"path": "a.ts"}))
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.text.contains("\"path\": \"a.ts\""));
    }

    #[tokio::test]
    async fn test_execute_not_found_is_error_text() {
        let exec = ToolExecutor::new(Arc::new(registry()));
        let outcome = exec.execute("nope.nothing", json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.text.starts_with("Tool not found: nope.nothing"));
        assert_eq!(outcome.tool_name, "nope.nothing");
    }

    #[tokio::test]
    async fn test_execute_error_is_captured() {
        let mut reg = ToolRegistry::new();
        reg.register(fake("x.fail", Behavior::Fail));
        let outcome = ToolExecutor::new(Arc::new(reg))
            .execute("x.fail", json!({}))
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.text, "Error executing tool x.fail: boom");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let mut reg = ToolRegistry::new();
        reg.register(fake("x.slow", Behavior::Sleep(Duration::from_secs(5))));
        let outcome = ToolExecutor::new(Arc::new(reg))
            .with_timeout(Duration::from_millis(20))
            .execute("x.slow", json!({}))
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text.contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_panic_is_captured() {
        let mut reg = ToolRegistry::new();
        reg.register(fake("x.panic", Behavior::Panic));
        let outcome = ToolExecutor::new(Arc::new(reg))
            .execute("x.panic", json!({}))
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_execute_error_text_is_capped() {
        let mut reg = ToolRegistry::new();
        reg.register(fake("x.loud", Behavior::FailBig(50_000)));
        let outcome = ToolExecutor::new(Arc::new(reg))
            .with_max_result_chars(100)
            .execute("x.loud", json!({}))
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text.starts_with("Error executing tool x.loud: xxx"));
        assert!(outcome.text.ends_with("[... truncated: showing first 100 of 50029 chars]"));
        assert!(outcome.text.chars().count() < 200);
    }

    #[tokio::test]
    async fn test_execute_truncates_by_chars() {
        let mut reg = ToolRegistry::new();
        reg.register(fake("x.big", Behavior::Big(25)));
        let outcome = ToolExecutor::new(Arc::new(reg))
            .with_max_result_chars(10)
            .execute("x.big", json!({}))
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.text.starts_with(&"é".repeat(10)));
        assert!(outcome
            .text
            .ends_with("[... truncated: showing first 10 of 25 chars]"));
    }

    #[test]
    fn test_tool_definitions_sorted() {
        let defs = registry().to_tool_definitions();
        assert_eq!(defs[0].function.name, "a.search");
        assert_eq!(defs[0].r#type, "function");
    }
}
