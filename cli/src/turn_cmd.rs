use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use relay_core::ConversationKey;
use relay_core::EventSink;
use relay_core::ExecutionResult;
use relay_core::ProgressEvent;
use relay_core::TurnError;
use relay_core::TurnOrchestrator;
use relay_core::TurnRequest;
use relay_core::pty::AbortReason;
use serde_json::json;
use tokio::sync::mpsc;

use crate::OutputFormat;

#[derive(Debug, Parser)]
pub struct TurnArgs {
    /// Chat the message belongs to.
    #[arg(long = "chat", value_name = "ID")]
    chat: String,
    /// Topic within the chat, for chats with threads.
    #[arg(long = "topic", value_name = "ID")]
    topic: Option<String>,
    /// Agent profile from the config.
    #[arg(long = "agent", value_name = "ID", default_value = "codex")]
    agent: String,
    /// Project directory for this turn. Remembered for the conversation.
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,
    /// Output format.
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Message text.
    #[arg(value_name = "PROMPT", required = true, num_args = 1..)]
    prompt: Vec<String>,
}

pub async fn run(args: TurnArgs, orchestrator: &TurnOrchestrator) -> Result<()> {
    let conversation = ConversationKey::new(args.chat, args.topic);
    let mut request = TurnRequest::new(conversation, args.agent, args.prompt.join(" "));
    request.cwd = args.cwd;

    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling turn");
            cancel.cancel(AbortReason::UserCancelled);
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let format = args.format;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_progress(&event, format);
        }
    });
    let events = EventSink::with_channel(tx);
    let result = orchestrator.submit(request, &events).await;
    // Closes the channel so the printer drains and stops.
    drop(events);
    let _ = printer.await;

    match result {
        Ok(result) => print_result(&result, format),
        Err(err) => fail(&err, format),
    }
}

fn print_progress(event: &ProgressEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to encode progress event"),
        },
        OutputFormat::Text => {
            if let Some(line) = describe(event) {
                eprintln!("{line}");
            }
        }
    }
}

fn describe(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::Status { phase } => {
            let phase = format!("{phase:?}").to_lowercase();
            Some(format!("[{phase}]"))
        }
        ProgressEvent::ToolActivity {
            tool,
            state,
            detail,
        } => Some(match detail {
            Some(detail) => format!("  {tool} {state:?}: {detail}"),
            None => format!("  {tool} {state:?}"),
        }),
        ProgressEvent::Session { thread_id } => Some(format!("session {thread_id}")),
        ProgressEvent::Warning { message } => Some(format!("warning: {message}")),
        // The reply and the failure are printed once the turn ends.
        ProgressEvent::OutputText { .. } | ProgressEvent::Error { .. } => None,
    }
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "text": result.text,
                "thread_id": result.thread_id,
                "conversation_id": result.conversation_id,
                "reused_session": result.reused_session,
            })
        ),
        OutputFormat::Text => println!("{}", result.text),
    }
    Ok(())
}

fn fail(err: &TurnError, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!(
            "{}",
            json!({
                "error": {
                    "kind": err.kind(),
                    "message": err.user_message(),
                }
            })
        );
    }
    if let Some(output) = err.output().filter(|output| !output.stdout.is_empty()) {
        tracing::debug!(stdout = %output.stdout, "output captured before the failure");
    }
    bail!(err.user_message())
}
