use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use relay_core::ConversationStore;
use relay_core::RelayConfig;
use relay_core::TurnOrchestrator;
use relay_core::store::FileConversationStore;
use relay_core::store::InMemoryConversationStore;

mod sessions_cmd;
mod thread_cmd;
mod turn_cmd;

/// Relays chat messages to coding-agent CLIs and keeps every conversation
/// attached to the agent session it started.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Config file to use instead of `$RELAY_HOME/config.toml`.
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one message to an agent and print its reply.
    Turn(turn_cmd::TurnArgs),
    /// List the agent sessions recorded for a directory.
    Sessions(sessions_cmd::SessionsArgs),
    /// Forget the session linked to a conversation.
    Reset(thread_cmd::ResetArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref()).context("failed to load config")?;
    let orchestrator = open_orchestrator(config).await?;
    match cli.command {
        Command::Turn(args) => turn_cmd::run(args, &orchestrator).await,
        Command::Sessions(args) => sessions_cmd::run(args, &orchestrator).await,
        Command::Reset(args) => thread_cmd::run(args, &orchestrator).await,
    }
}

async fn open_orchestrator(config: RelayConfig) -> Result<TurnOrchestrator> {
    let store: Arc<dyn ConversationStore> = match &config.state_file {
        Some(path) => Arc::new(
            FileConversationStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open state file {}", path.display()))?,
        ),
        None => {
            tracing::debug!("no state file configured, links last for this process only");
            Arc::new(InMemoryConversationStore::new())
        }
    };
    Ok(TurnOrchestrator::new(config, store))
}

/// Logs go to stderr so `--format json` output stays machine readable.
fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
