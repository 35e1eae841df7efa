use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use pairflow::agent_core::{ChatEvent, ChatMode};
use pairflow::commands::chat::{self, ChatStreamParams};
use pairflow::commands::settings::ChatSettings;
use pairflow::inference::config::{find_config_path, load_models_config};
use pairflow::inference::InferenceClient;

/// Run one pair-programming request against a project directory.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Project root the model reads and edits.
    project_dir: PathBuf,

    /// Prompt text; remaining arguments are joined with spaces.
    #[arg(required = true, trailing_var_arg = true)]
    prompt: Vec<String>,

    /// Answer without proposing file changes.
    #[arg(long)]
    ask: bool,

    /// Write completed directives to disk when the response finishes.
    #[arg(long)]
    apply: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    pairflow::init_tracing();

    let project_root = std::fs::canonicalize(&args.project_dir)
        .with_context(|| format!("project directory not found: {}", args.project_dir.display()))?;

    let cwd = std::env::current_dir().context("cannot read working directory")?;
    let config_path = find_config_path(&cwd)?;
    let models = load_models_config(&config_path)?;
    let client = InferenceClient::from_config(&models)?;
    tracing::info!(model = %client.primary_model_name(), "inference client ready");

    let mut settings = ChatSettings::load_or_default();
    if args.apply {
        settings.auto_apply_changes = true;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let store = pairflow::open_store()?;
    let state = Arc::new(pairflow::build_state(
        project_root,
        Arc::new(client),
        Arc::new(tx),
        store,
        settings,
    ));

    let prompt = args.prompt.join(" ");
    let title: String = prompt.chars().take(60).collect();
    let conversation =
        chat::create_conversation(&state, Some(title)).map_err(anyhow::Error::msg)?;

    let cancel_state = state.clone();
    let conversation_id = conversation.id;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            chat::chat_cancel(&cancel_state, conversation_id);
        }
    });

    let printer = tokio::spawn(print_events(rx));

    let params = ChatStreamParams {
        conversation_id,
        prompt,
        attachments: Vec::new(),
        mode: args.ask.then_some(ChatMode::Ask),
    };
    let result = chat::chat_stream(&state, params).await;
    printer.await.context("event printer panicked")??;

    result.map(|_| ()).map_err(anyhow::Error::msg)
}

/// Print the growing reply to stdout, then the end signal as JSON.
async fn print_events(mut rx: mpsc::UnboundedReceiver<ChatEvent>) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut shown = String::new();

    while let Some(event) = rx.recv().await {
        match &event {
            ChatEvent::Snapshot { messages, .. } => {
                let Some(reply) = messages.last() else {
                    continue;
                };
                match reply.content.strip_prefix(shown.as_str()) {
                    Some(delta) => write!(stdout, "{delta}")?,
                    // Normalization rewrote earlier text; reprint in full.
                    None => write!(stdout, "\n{}", reply.content)?,
                }
                stdout.flush()?;
                shown = reply.content.clone();
            }
            ChatEvent::Error { error, .. } => {
                eprintln!("\nerror: {error}");
                break;
            }
            ChatEvent::End { .. } => {
                writeln!(stdout, "\n{}", serde_json::to_string(&event)?)?;
                break;
            }
        }
    }
    Ok(())
}
