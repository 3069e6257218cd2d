use serde::Serialize;
use thiserror::Error;

/// Why the supervisor asked the child to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Timeout,
    Abort,
    MaxBuffer,
    NaturalExit,
}

/// Whatever the child wrote before it finished or was stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    /// Empty under a pty: the terminal merges both streams into `stdout`.
    pub stderr: String,
}

impl CapturedOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        let mut text = self.stdout.clone();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        text
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {source}")]
    Spawn {
        #[source]
        source: anyhow::Error,
    },
    #[error("process stopped: {reason:?}")]
    Stopped {
        reason: StopReason,
        output: CapturedOutput,
    },
    #[error("process exited with {}", describe_exit(*code, signal.as_deref()))]
    Exited {
        code: Option<i32>,
        signal: Option<String>,
        output: CapturedOutput,
    },
}

impl ProcessError {
    pub(crate) fn spawn(source: impl Into<anyhow::Error>) -> Self {
        Self::Spawn {
            source: source.into(),
        }
    }

    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            ProcessError::Spawn { .. } => None,
            ProcessError::Stopped { output, .. } | ProcessError::Exited { output, .. } => {
                Some(output)
            }
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            ProcessError::Stopped { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

fn describe_exit(code: Option<i32>, signal: Option<&str>) -> String {
    match (code, signal) {
        (_, Some(signal)) => format!("signal {signal}"),
        (Some(code), None) => format!("exit code {code}"),
        (None, None) => "unknown status".to_string(),
    }
}
