use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;

#[expect(clippy::expect_used)]
static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("static ansi pattern")
});

/// Removes terminal control sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").replace('\r', "")
}

/// What a batch-mode CLI printed, reduced to the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
    pub text: String,
    pub thread_id: Option<String>,
    /// True when the reply came from a JSON result line rather than raw
    /// terminal text.
    pub structured: bool,
}

/// Prefers the last JSON line carrying `result` or `text`; falls back to the
/// cleaned terminal text.
pub fn parse_batch_output(raw: &str) -> BatchOutput {
    let clean = strip_ansi(raw);
    for line in clean.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let text = ["result", "text"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str));
        if let Some(text) = text {
            let thread_id = ["session_id", "thread_id"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            return BatchOutput {
                text: text.trim().to_string(),
                thread_id,
                structured: true,
            };
        }
    }
    BatchOutput {
        text: clean.trim().to_string(),
        thread_id: None,
        structured: false,
    }
}
