use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::pty::CapturedOutput;
use crate::pty::ProcessError;
use crate::pty::StopReason;
use crate::sessions::SessionRecord;

pub type Result<T> = std::result::Result<T, TurnError>;

/// Coarse classification attached to every failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CliMissing,
    SessionNotFound,
    ApprovalRequired,
    SandboxDenied,
    Timeout,
    AmbiguousResolution,
    StaleSession,
    NoVisibleSession,
    Cancelled,
    OutputLimit,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CliMissing => "cli_missing",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::ApprovalRequired => "approval_required",
            ErrorKind::SandboxDenied => "sandbox_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AmbiguousResolution => "ambiguous_resolution",
            ErrorKind::StaleSession => "stale_session",
            ErrorKind::NoVisibleSession => "no_visible_session",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::OutputLimit => "output_limit",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// 127 is the shell's "command not found"; 126 is "found but not executable".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;
const EXIT_NOT_EXECUTABLE: i32 = 126;

#[expect(clippy::expect_used)]
fn pattern(src: &str) -> Regex {
    Regex::new(src).expect("static classification pattern")
}

static CLI_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(command not found|no such file or directory|not installed|enoent|executable file not found)")
});
static SESSION_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)((session|thread|conversation|rollout)( id)? (\S+ )?(not found|does not exist)|no (such )?(session|thread|conversation) (found|with id))")
});
static APPROVAL_REQUIRED: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(approval (is )?required|requires? (your )?approval|waiting for approval|approve this)")
});
static SANDBOX_DENIED: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(sandbox(ed)? (denied|violation|blocked)|blocked by (the )?sandbox|operation not permitted|permission denied)")
});
static TIMEOUT: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)(timed out|timeout exceeded|deadline exceeded)"));

/// Maps a process exit code and captured output to an [`ErrorKind`].
///
/// This is a heuristic. Anything that does not match a known pattern is
/// reported as [`ErrorKind::Unknown`].
pub fn classify(exit_code: Option<i32>, text: &str) -> ErrorKind {
    if matches!(exit_code, Some(EXIT_COMMAND_NOT_FOUND | EXIT_NOT_EXECUTABLE)) {
        return ErrorKind::CliMissing;
    }
    // Session lookups are checked before the generic "not found" wording
    // used by missing binaries.
    if SESSION_NOT_FOUND.is_match(text) {
        return ErrorKind::SessionNotFound;
    }
    if CLI_MISSING.is_match(text) {
        return ErrorKind::CliMissing;
    }
    if APPROVAL_REQUIRED.is_match(text) {
        return ErrorKind::ApprovalRequired;
    }
    if SANDBOX_DENIED.is_match(text) {
        return ErrorKind::SandboxDenied;
    }
    if TIMEOUT.is_match(text) {
        return ErrorKind::Timeout;
    }
    ErrorKind::Unknown
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("unknown agent `{agent_id}`")]
    UnknownAgent { agent_id: String },

    #[error("agent CLI is not available: {message}")]
    CliMissing { message: String },

    #[error("session {thread_id} was not found by the agent")]
    SessionNotFound { thread_id: String },

    #[error("agent is waiting for an approval")]
    ApprovalRequired { output: CapturedOutput },

    #[error("agent action was denied by its sandbox")]
    SandboxDenied { output: CapturedOutput },

    #[error("agent did not finish within {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        output: CapturedOutput,
    },

    #[error("turn was cancelled")]
    Cancelled { output: CapturedOutput },

    #[error("agent output exceeded {limit} bytes")]
    OutputLimit { limit: usize, output: CapturedOutput },

    #[error("{} sessions were created during the turn; refusing to pick one", candidates.len())]
    AmbiguousResolution { candidates: Vec<SessionRecord> },

    #[error(
        "session {thread_id} belongs to {}, not {}",
        session_dir.display(),
        working_dir.display()
    )]
    StaleSession {
        thread_id: String,
        session_dir: PathBuf,
        working_dir: PathBuf,
    },

    #[error("the agent exited without creating a visible session")]
    NoVisibleSession,

    #[error("agent failed ({kind}): {message}")]
    Agent {
        kind: ErrorKind,
        message: String,
        output: CapturedOutput,
    },

    #[error("session lookup failed: {0}")]
    Sessions(#[from] crate::sessions::SessionLogError),

    #[error(transparent)]
    Process(ProcessError),
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::UnknownAgent { .. } | TurnError::CliMissing { .. } => ErrorKind::CliMissing,
            TurnError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            TurnError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            TurnError::SandboxDenied { .. } => ErrorKind::SandboxDenied,
            TurnError::Timeout { .. } => ErrorKind::Timeout,
            TurnError::Cancelled { .. } => ErrorKind::Cancelled,
            TurnError::OutputLimit { .. } => ErrorKind::OutputLimit,
            TurnError::AmbiguousResolution { .. } => ErrorKind::AmbiguousResolution,
            TurnError::StaleSession { .. } => ErrorKind::StaleSession,
            TurnError::NoVisibleSession => ErrorKind::NoVisibleSession,
            TurnError::Agent { kind, .. } => *kind,
            TurnError::Sessions(_) | TurnError::Process(_) => ErrorKind::Unknown,
        }
    }

    /// Output captured before the failure, when there was a process.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            TurnError::ApprovalRequired { output }
            | TurnError::SandboxDenied { output }
            | TurnError::Timeout { output, .. }
            | TurnError::Cancelled { output }
            | TurnError::OutputLimit { output, .. }
            | TurnError::Agent { output, .. } => Some(output),
            TurnError::Process(err) => err.output(),
            _ => None,
        }
    }

    /// Text suitable for showing to the person on the other side of the chat.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::AmbiguousResolution { candidates } => {
                let ids = candidates
                    .iter()
                    .map(|record| record.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Could not safely associate a new session ({ids}). Retry, or resume the last known session."
                )
            }
            TurnError::StaleSession {
                thread_id,
                session_dir,
                working_dir,
            } => format!(
                "Session {thread_id} was started in {} but this conversation now points at {}. The stale link was cleared; send the message again to start a fresh session.",
                session_dir.display(),
                working_dir.display()
            ),
            TurnError::NoVisibleSession => {
                "The agent ran but no visible session was created. Retry, or check that the agent CLI is logged in.".to_string()
            }
            TurnError::SessionNotFound { thread_id } => format!(
                "The agent no longer knows session {thread_id}. Reset the conversation to start over."
            ),
            TurnError::Timeout { timeout_ms, .. } => {
                format!("The agent did not answer within {}s.", timeout_ms / 1_000)
            }
            TurnError::Cancelled { .. } => "The turn was cancelled.".to_string(),
            other => other.to_string(),
        }
    }

    /// Converts a supervisor failure into a turn failure, classifying the
    /// captured output when the process simply exited with an error.
    pub(crate) fn from_process(err: ProcessError, context: &FailureContext<'_>) -> Self {
        let timeout_ms = context.timeout_ms;
        match err {
            ProcessError::Spawn { ref source } => TurnError::CliMissing {
                message: source.to_string(),
            },
            ProcessError::Stopped { reason, output } => match reason {
                StopReason::Timeout => TurnError::Timeout { timeout_ms, output },
                StopReason::Abort => TurnError::Cancelled { output },
                StopReason::MaxBuffer => TurnError::OutputLimit {
                    limit: context.max_buffer_bytes,
                    output,
                },
                StopReason::NaturalExit => TurnError::Process(ProcessError::Stopped { reason, output }),
            },
            ProcessError::Exited { code, signal, output } => {
                let text = output.combined();
                let kind = classify(code, &text);
                let message = last_line(&text).unwrap_or_else(|| match (code, signal.as_deref()) {
                    (_, Some(signal)) => format!("terminated by {signal}"),
                    (Some(code), None) => format!("exit code {code}"),
                    (None, None) => "exited abnormally".to_string(),
                });
                match kind {
                    ErrorKind::CliMissing => TurnError::CliMissing { message },
                    ErrorKind::SessionNotFound => TurnError::SessionNotFound {
                        thread_id: context.thread_id.unwrap_or_default().to_string(),
                    },
                    ErrorKind::ApprovalRequired => TurnError::ApprovalRequired { output },
                    ErrorKind::SandboxDenied => TurnError::SandboxDenied { output },
                    ErrorKind::Timeout => TurnError::Timeout { timeout_ms, output },
                    kind => TurnError::Agent {
                        kind,
                        message,
                        output,
                    },
                }
            }
        }
    }
}

/// What the caller knew about the failed invocation.
pub(crate) struct FailureContext<'a> {
    pub timeout_ms: u64,
    pub max_buffer_bytes: usize,
    pub thread_id: Option<&'a str>,
}

fn last_line(text: &str) -> Option<String> {
    let line = crate::agent::strip_ansi(text)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())?
        .to_string();
    Some(line)
}
