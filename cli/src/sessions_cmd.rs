use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use relay_core::SessionRecord;
use relay_core::TurnOrchestrator;

use crate::OutputFormat;

#[derive(Debug, Parser)]
pub struct SessionsArgs {
    /// Agent profile from the config.
    #[arg(long = "agent", value_name = "ID", default_value = "codex")]
    agent: String,
    /// Directory to list sessions for (defaults to the current directory).
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,
    /// Maximum number of sessions to show.
    #[arg(long = "limit", default_value_t = 20)]
    limit: usize,
    /// Output format.
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

pub async fn run(args: SessionsArgs, orchestrator: &TurnOrchestrator) -> Result<()> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    let records = orchestrator
        .list_sessions(&args.agent, &cwd, args.limit)
        .await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print_table(&records),
    }
    Ok(())
}

fn print_table(records: &[SessionRecord]) {
    if records.is_empty() {
        println!("No sessions found.");
        return;
    }
    for record in records {
        println!(
            "{}  {}  {:<7}  {}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.source.as_str(),
            record.display_name
        );
    }
}
