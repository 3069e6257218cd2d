//! Agent CLI profiles and how their command lines are put together.

mod output;
mod streaming;

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;

pub use output::BatchOutput;
pub use output::parse_batch_output;
pub use output::strip_ansi;
pub use streaming::CodexExecClient;
pub use streaming::StreamOutcome;
pub use streaming::StreamRequest;
pub use streaming::StreamingClient;

const THREAD_ID_PLACEHOLDER: &str = "{thread_id}";
const PROMPT_PLACEHOLDER: &str = "{prompt}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// A JSONL event stream over pipes; the stream reports the thread id.
    Streaming,
    /// An interactive CLI run under a pty; the session is found afterwards.
    #[default]
    Pty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub transport: Transport,

    pub program: String,

    /// Arguments for a turn that starts a new session. `{prompt}` marks
    /// where the prompt goes; it is appended otherwise.
    #[serde(default)]
    pub new_args: Vec<String>,

    /// Arguments for a turn that continues `{thread_id}`.
    #[serde(default)]
    pub resume_args: Vec<String>,

    /// Root of the CLI's session logs.
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,

    /// Optional relational thread index kept by the CLI.
    #[serde(default)]
    pub index_db: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentProfile {
    pub fn codex() -> Self {
        Self {
            transport: Transport::Streaming,
            program: "codex".to_string(),
            new_args: Vec::new(),
            resume_args: Vec::new(),
            sessions_dir: Some(PathBuf::from("~/.codex/sessions")),
            index_db: None,
            env: BTreeMap::new(),
        }
    }

    /// Shell command line for one pty turn. Only the program and the
    /// configured arguments are quoted into the line; the prompt travels
    /// base64-encoded and is decoded by the shell.
    pub fn command_line(
        &self,
        prompt: &str,
        thread_id: Option<&str>,
    ) -> Result<String, shlex::QuoteError> {
        let args = match thread_id {
            Some(_) => &self.resume_args,
            None => &self.new_args,
        };
        let prompt_arg = decoded_prompt(prompt);

        let mut line = shlex::try_quote(&self.program)?.into_owned();
        let mut placed = false;
        for arg in args {
            line.push(' ');
            if arg == PROMPT_PLACEHOLDER {
                line.push_str(&prompt_arg);
                placed = true;
                continue;
            }
            let arg = match thread_id {
                Some(thread_id) => arg.replace(THREAD_ID_PLACEHOLDER, thread_id),
                None => arg.clone(),
            };
            line.push_str(&shlex::try_quote(&arg)?);
        }
        if !placed {
            line.push(' ');
            line.push_str(&prompt_arg);
        }
        Ok(line)
    }
}

/// A double-quoted command substitution that expands to `prompt`.
fn decoded_prompt(prompt: &str) -> String {
    let encoded = BASE64.encode(prompt.as_bytes());
    format!("\"$(printf '%s' '{encoded}' | base64 -d)\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile() -> AgentProfile {
        AgentProfile {
            transport: Transport::Pty,
            program: "claude".to_string(),
            new_args: vec!["--print".to_string(), "--output-format".to_string(), "json".to_string()],
            resume_args: vec![
                "--resume".to_string(),
                "{thread_id}".to_string(),
                "{prompt}".to_string(),
                "--print".to_string(),
            ],
            sessions_dir: None,
            index_db: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn prompt_is_never_spliced_into_the_line() {
        let prompt = "hi'; rm -rf / #$(whoami)";
        let line = profile().command_line(prompt, None).expect("command line");
        assert!(!line.contains("rm -rf"));
        assert!(!line.contains("whoami"));
        let encoded = BASE64.encode(prompt);
        assert_eq!(
            line,
            format!("claude --print --output-format json \"$(printf '%s' '{encoded}' | base64 -d)\"")
        );
    }

    #[test]
    fn resume_substitutes_thread_id_and_places_prompt() {
        let line = profile()
            .command_line("go on", Some("0199a213-81c0-7800-8aa1-bbab2a035a53"))
            .expect("command line");
        let encoded = BASE64.encode("go on");
        assert_eq!(
            line,
            format!(
                "claude --resume 0199a213-81c0-7800-8aa1-bbab2a035a53 \"$(printf '%s' '{encoded}' | base64 -d)\" --print"
            )
        );
    }

    #[test]
    fn odd_arguments_are_quoted() {
        let mut profile = profile();
        profile.program = "/opt/my agent/bin".to_string();
        profile.new_args = vec!["--name=it's".to_string()];
        let line = profile.command_line("x", None).expect("command line");
        let words = shlex::split(&line).expect("splittable");
        assert_eq!(words[0], "/opt/my agent/bin");
        assert_eq!(words[1], "--name=it's");
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let mut profile = profile();
        profile.new_args = vec!["a\0b".to_string()];
        assert!(profile.command_line("x", None).is_err());
    }
}
