use anyhow::Result;
use clap::Parser;
use relay_core::ConversationKey;
use relay_core::TurnOrchestrator;

#[derive(Debug, Parser)]
pub struct ResetArgs {
    #[arg(long = "chat", value_name = "ID")]
    chat: String,
    #[arg(long = "topic", value_name = "ID")]
    topic: Option<String>,
    #[arg(long = "agent", value_name = "ID", default_value = "codex")]
    agent: String,
}

pub async fn run(args: ResetArgs, orchestrator: &TurnOrchestrator) -> Result<()> {
    let conversation = ConversationKey::new(args.chat, args.topic);
    orchestrator.reset_thread(&conversation, &args.agent).await?;
    println!(
        "Cleared the {} session for {conversation}; the next message starts a new one.",
        args.agent
    );
    Ok(())
}
