pub mod agent_core;
pub mod commands;
pub mod inference;

use std::path::PathBuf;
use std::sync::Arc;

use agent_core::diagnostics::{CommandDiagnostics, DiagnosticsProvider, NoDiagnostics};
use agent_core::tools::{ListDirectoryTool, ReadFileTool};
use agent_core::{
    AgentError, ChatStore, EventSink, OrchestratorSettings, SqliteChatStore, StreamOrchestrator,
    ToolExecutor, ToolRegistry,
};
use commands::settings::ChatSettings;
use inference::ModelClient;

/// Async mutex for types that require `.await` inside their methods.
pub type TokioMutex<T> = tokio::sync::Mutex<T>;

/// Shared state handed to every IPC command.
pub struct AppState {
    pub orchestrator: Arc<StreamOrchestrator>,
    pub store: Arc<dyn ChatStore>,
    pub settings: TokioMutex<ChatSettings>,
}

/// Return the platform-standard data directory for pairflow.
///
/// - macOS: `~/Library/Application Support/pairflow/`
/// - Windows: `{FOLDERID_RoamingAppData}\pairflow\`
/// - Linux: `$XDG_DATA_HOME/pairflow/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.pairflow/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("pairflow");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pairflow")
}

/// Initialize the tracing subscriber. Writes structured logs to the app data directory.
///
/// On each startup:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the data directory path for discoverability.
///
/// Falls back to stderr when the log file cannot be opened.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let log_path = log_dir.join("agent.log");

    // Rotate: agent.log.2 → .3, .1 → .2, agent.log → .1
    rotate_log_file(&log_path, 3);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pairflow=info,warn"));

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(log_file) => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(FlushingWriter::new(log_file))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .init(),
        Err(e) => {
            fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .init();
            tracing::warn!(error = %e, path = %log_path.display(), "failed to open log file");
        }
    }

    // Startup banner
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== pairflow starting ==="
    );
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps the tail of a stream that was interrupted mid-response on disk.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the path for the chat SQLite database.
///
/// Uses the platform-standard data directory (creates it if needed).
pub fn resolve_db_path() -> String {
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join("pairflow.db").to_string_lossy().into_owned()
}

/// Built-in project tools plus the configured alias table.
pub fn build_tool_executor(project_root: &std::path::Path, settings: &ChatSettings) -> ToolExecutor {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(project_root)));
    registry.register(Arc::new(ListDirectoryTool::new(project_root)));
    registry.set_aliases(settings.tool_aliases.clone());
    tracing::info!(tools = ?registry.tool_names(), "tool registry ready");

    ToolExecutor::new(Arc::new(registry))
        .with_timeout(settings.tool_timeout())
        .with_max_result_chars(settings.max_tool_result_chars)
}

/// The configured static checker, or none.
pub fn build_diagnostics(settings: &ChatSettings) -> Arc<dyn DiagnosticsProvider> {
    match &settings.diagnostics {
        Some(command) => {
            tracing::info!(program = %command.program, "diagnostics enabled");
            Arc::new(CommandDiagnostics::new(command.clone()))
        }
        None => Arc::new(NoDiagnostics),
    }
}

/// Wire the store, tools, diagnostics and orchestrator for `project_root`.
pub fn build_state(
    project_root: PathBuf,
    model: Arc<dyn ModelClient>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn ChatStore>,
    settings: ChatSettings,
) -> AppState {
    let orchestrator = StreamOrchestrator::new(
        model,
        store.clone(),
        build_tool_executor(&project_root, &settings),
        build_diagnostics(&settings),
        sink,
        project_root,
        OrchestratorSettings::from(&settings),
    );
    AppState {
        orchestrator: Arc::new(orchestrator),
        store,
        settings: TokioMutex::new(settings),
    }
}

/// Open the chat database in the app data directory.
pub fn open_store() -> Result<Arc<dyn ChatStore>, AgentError> {
    let db_path = resolve_db_path();
    let store = SqliteChatStore::open(&db_path)?;
    tracing::info!(path = %db_path, "chat database opened");
    Ok(Arc::new(store))
}
