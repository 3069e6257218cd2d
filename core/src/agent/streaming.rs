use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::AgentProfile;
use crate::error::FailureContext;
use crate::error::Result;
use crate::error::TurnError;
use crate::events::EventSink;
use crate::events::ProgressEvent;
use crate::events::ToolState;
use crate::events::TurnPhase;
use crate::pty::CapturedOutput;
use crate::pty::ProcessError;
use crate::pty::StopReason;
use crate::pty::TurnCancellation;

/// How long the pipes are still read after the agent exits. A grandchild
/// holding them must not keep the turn open.
const POST_EXIT_DRAIN: Duration = Duration::from_millis(250);
const KILL_WAIT: Duration = Duration::from_secs(2);
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub struct StreamRequest<'a> {
    pub prompt: &'a str,
    /// Continue this thread instead of starting one.
    pub thread_id: Option<&'a str>,
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub max_buffer_bytes: usize,
    pub cancel: &'a TurnCancellation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// `None` if the stream never announced its thread.
    pub thread_id: Option<String>,
    pub text: String,
}

/// An agent that reports its own thread id and progress over a structured
/// event stream.
#[async_trait]
pub trait StreamingClient: Send + Sync {
    async fn run(&self, request: StreamRequest<'_>, events: &EventSink) -> Result<StreamOutcome>;
}

/// Drives `codex exec --json` and maps its JSONL events.
#[derive(Debug, Clone)]
pub struct CodexExecClient {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CodexExecClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn from_profile(profile: &AgentProfile) -> Self {
        Self {
            program: profile.program.clone(),
            args: profile.new_args.clone(),
            env: profile.env.clone(),
        }
    }
}

#[async_trait]
impl StreamingClient for CodexExecClient {
    async fn run(&self, request: StreamRequest<'_>, events: &EventSink) -> Result<StreamOutcome> {
        let mut command = Command::new(&self.program);
        command.arg("exec").arg("--json").args(&self.args);
        if let Some(thread_id) = request.thread_id {
            command.arg("resume").arg(thread_id);
        }
        command
            .arg(request.prompt)
            .current_dir(request.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| TurnError::CliMissing {
            message: format!("{}: {err}", self.program),
        })?;
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TurnError::Process(ProcessError::spawn(anyhow::anyhow!(
                "child pipes were not captured"
            ))));
        };
        tracing::debug!(program = %self.program, resume = request.thread_id.is_some(), "started streaming agent");

        let mut lines = LineBuffer::new(request.max_buffer_bytes);
        let mut stderr_tail = Vec::new();
        let mut out_chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut err_chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut status: Option<std::io::Result<ExitStatus>> = None;
        let mut state = StreamState::default();

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        // Armed once the child exits.
        let drain = tokio::time::sleep(request.timeout);
        tokio::pin!(drain);

        let stop = loop {
            if status.is_some() && !stdout_open && !stderr_open {
                break None;
            }
            tokio::select! {
                read = stdout.read(&mut out_chunk), if stdout_open => match read {
                    Ok(0) => {
                        stdout_open = false;
                        if let Some(line) = lines.finish() {
                            state.apply(&line, events);
                        }
                    }
                    Ok(n) => match lines.push(&out_chunk[..n]) {
                        Some(complete) => {
                            for line in complete {
                                state.apply(&line, events);
                            }
                        }
                        None => break Some(StopReason::MaxBuffer),
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read agent event stream");
                        stdout_open = false;
                    }
                },
                read = stderr.read(&mut err_chunk), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => keep_capped(&mut stderr_tail, &err_chunk[..n], request.max_buffer_bytes),
                },
                exit = child.wait(), if status.is_none() => {
                    drain
                        .as_mut()
                        .reset(tokio::time::Instant::now() + POST_EXIT_DRAIN);
                    status = Some(exit);
                }
                _ = &mut drain, if status.is_some() => {
                    tracing::debug!("agent exited but its output pipes are still open");
                    stdout_open = false;
                    stderr_open = false;
                }
                _ = request.cancel.cancelled(), if status.is_none() => break Some(StopReason::Abort),
                _ = &mut deadline, if status.is_none() => break Some(StopReason::Timeout),
            }
        };

        if stop.is_some() && status.is_none() {
            if let Err(err) = child.start_kill() {
                tracing::warn!(error = %err, "failed to kill streaming agent");
            }
            if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
                tracing::warn!("streaming agent did not exit after kill");
            }
        }
        let stderr = String::from_utf8_lossy(&stderr_tail).into_owned();

        let context = FailureContext {
            timeout_ms: u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
            max_buffer_bytes: request.max_buffer_bytes,
            thread_id: request.thread_id,
        };
        if let Some(reason) = stop {
            let output = CapturedOutput {
                stdout: state.reply(),
                stderr,
            };
            return Err(TurnError::from_process(
                ProcessError::Stopped { reason, output },
                &context,
            ));
        }

        let code = match &status {
            Some(Ok(status)) => status.code(),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "failed to wait for streaming agent");
                None
            }
            None => None,
        };
        let succeeded = matches!(&status, Some(Ok(status)) if status.success());

        if let Some(failure) = state.failure.take() {
            return Err(TurnError::from_process(
                ProcessError::Exited {
                    code,
                    signal: None,
                    output: CapturedOutput {
                        stdout: failure,
                        stderr,
                    },
                },
                &context,
            ));
        }
        let text = state.reply();
        if !succeeded {
            if text.is_empty() {
                return Err(TurnError::from_process(
                    ProcessError::Exited {
                        code,
                        signal: None,
                        output: CapturedOutput {
                            stdout: text,
                            stderr,
                        },
                    },
                    &context,
                ));
            }
            tracing::warn!(?code, "agent exited with an error after replying");
            events.warning(format!(
                "agent exited with code {} after replying",
                code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
            ));
        }

        Ok(StreamOutcome {
            thread_id: state.thread_id,
            text,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ExecEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "item.started")]
    ItemStarted { item: ExecItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ExecItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {},
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ExecFailure },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ExecItem {
    #[serde(rename = "type", alias = "item_type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecFailure {
    message: String,
}

#[derive(Debug, Default)]
struct StreamState {
    thread_id: Option<String>,
    messages: Vec<String>,
    failure: Option<String>,
}

impl StreamState {
    fn apply(&mut self, line: &str, events: &EventSink) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event = match serde_json::from_str::<ExecEvent>(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring non-event line from agent");
                return;
            }
        };
        match event {
            ExecEvent::ThreadStarted { thread_id } => {
                events.emit(ProgressEvent::Session {
                    thread_id: thread_id.clone(),
                });
                self.thread_id = Some(thread_id);
            }
            ExecEvent::TurnStarted {} => events.status(TurnPhase::Running),
            ExecEvent::ItemStarted { item } => {
                if let Some(event) = tool_activity(&item, ToolState::Started) {
                    events.emit(event);
                }
            }
            ExecEvent::ItemCompleted { item } => {
                if item.kind == "agent_message" {
                    if let Some(text) = item.text.filter(|text| !text.trim().is_empty()) {
                        events.emit(ProgressEvent::OutputText { text: text.clone() });
                        self.messages.push(text);
                    }
                    return;
                }
                let state = if item.status.as_deref() == Some("failed") {
                    ToolState::Failed
                } else {
                    ToolState::Completed
                };
                if let Some(event) = tool_activity(&item, state) {
                    events.emit(event);
                }
            }
            ExecEvent::TurnFailed { error } => self.failure = Some(error.message),
            ExecEvent::Error { message } => self.failure = Some(message),
            ExecEvent::TurnCompleted {} | ExecEvent::Other => {}
        }
    }

    fn reply(&self) -> String {
        self.messages.join("\n\n")
    }
}

fn tool_activity(item: &ExecItem, state: ToolState) -> Option<ProgressEvent> {
    if matches!(item.kind.as_str(), "" | "agent_message" | "reasoning") {
        return None;
    }
    Some(ProgressEvent::ToolActivity {
        tool: item.tool.clone().unwrap_or_else(|| item.kind.clone()),
        state,
        detail: item.command.clone(),
    })
}

/// Splits the event stream into lines, counting every byte against the
/// output limit.
#[derive(Debug)]
struct LineBuffer {
    pending: Vec<u8>,
    seen: usize,
    limit: usize,
}

impl LineBuffer {
    fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            seen: 0,
            limit,
        }
    }

    /// The lines completed by `chunk`, or `None` once the stream has gone
    /// past the limit.
    fn push(&mut self, chunk: &[u8]) -> Option<Vec<String>> {
        self.seen = self.seen.saturating_add(chunk.len());
        if self.seen > self.limit {
            return None;
        }
        self.pending.extend_from_slice(chunk);
        let mut complete = Vec::new();
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            complete.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        Some(complete)
    }

    /// A trailing line with no newline.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn keep_capped(kept: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    let room = limit.saturating_sub(kept.len());
    kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
}
