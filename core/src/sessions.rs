//! Read-only access to the agent CLI's on-disk session logs.
//!
//! Every session is an append-only JSONL file whose first record is a
//! `session_meta` line. Only the head of each file is read.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

const HEAD_BYTES: u64 = 24 * 1024;
const DISPLAY_NAME_CHARS: usize = 80;
const ID_PREFIX_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Cli,
    Exec,
    Unknown,
}

impl SessionSource {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cli" => SessionSource::Cli,
            "exec" => SessionSource::Exec,
            _ => SessionSource::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionSource::Cli => "cli",
            SessionSource::Exec => "exec",
            SessionSource::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub source: SessionSource,
    pub display_name: String,
    /// `None` when the record came from the relational index.
    pub backing_file: Option<PathBuf>,
}

/// Sessions known for a working directory right before a new-session turn.
///
/// Not `Clone`: a snapshot belongs to exactly one turn.
#[derive(Debug)]
pub struct Snapshot {
    pub previous_latest_id: Option<String>,
    pub previous_ids: HashSet<String>,
    pub started_at: DateTime<Utc>,
    pub count: usize,
}

impl Snapshot {
    /// A baseline with no known sessions.
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            previous_latest_id: None,
            previous_ids: HashSet::new(),
            started_at,
            count: 0,
        }
    }

    /// The only session known before the turn, if there was exactly one.
    pub fn sole_previous_id(&self) -> Option<&str> {
        match self.count {
            1 => self.previous_latest_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("failed to read sessions directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Session ids are versioned UUIDs; anything else is not a session.
pub fn is_session_id(raw: &str) -> bool {
    Uuid::parse_str(raw).is_ok_and(|uuid| !uuid.is_nil() && matches!(uuid.get_version_num(), 1..=8))
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    root: PathBuf,
}

impl SessionLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sessions for `working_dir` (or a directory nested under it), newest
    /// file path first.
    pub async fn list_sessions(
        &self,
        working_dir: &Path,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, SessionLogError> {
        self.scan(working_dir, limit, |_| true).await
    }

    pub async fn list_sessions_since(
        &self,
        working_dir: &Path,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, SessionLogError> {
        self.scan(working_dir, limit, move |record| record.created_at >= since)
            .await
    }

    /// Sessions created at or after `since` that were not already known.
    /// `cli` sessions come first, then newest first.
    pub async fn find_newest_diff(
        &self,
        working_dir: &Path,
        previous_ids: &HashSet<String>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, SessionLogError> {
        let previous_ids = previous_ids.clone();
        let mut records = self
            .scan(working_dir, limit, move |record| {
                record.created_at >= since && !previous_ids.contains(&record.id)
            })
            .await?;
        sort_cli_first(&mut records);
        Ok(records)
    }

    /// Looks up a single session by id regardless of its working directory.
    pub async fn find_session(&self, id: &str) -> Result<Option<SessionRecord>, SessionLogError> {
        let root = self.root.clone();
        let id = id.to_string();
        let found = tokio::task::spawn_blocking(move || {
            let mut paths = session_files(&root)?;
            // File names usually embed the id, so try those first.
            paths.sort_by_key(|path| !file_name_contains(path, &id));
            Ok::<_, SessionLogError>(
                paths
                    .iter()
                    .filter_map(|path| read_record(path))
                    .find(|record| record.id == id),
            )
        })
        .await??;
        Ok(found)
    }

    pub async fn take_snapshot(
        &self,
        working_dir: &Path,
        started_at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Snapshot, SessionLogError> {
        let records = self.list_sessions(working_dir, limit).await?;
        let previous_latest_id = records
            .iter()
            .max_by_key(|record| record.created_at)
            .map(|record| record.id.clone());
        let previous_ids: HashSet<String> =
            records.iter().map(|record| record.id.clone()).collect();
        tracing::debug!(
            cwd = %working_dir.display(),
            count = records.len(),
            latest = ?previous_latest_id,
            "took session snapshot"
        );
        Ok(Snapshot {
            previous_latest_id,
            count: previous_ids.len(),
            previous_ids,
            started_at,
        })
    }

    async fn scan<F>(
        &self,
        working_dir: &Path,
        limit: usize,
        keep: F,
    ) -> Result<Vec<SessionRecord>, SessionLogError>
    where
        F: Fn(&SessionRecord) -> bool + Send + 'static,
    {
        let root = self.root.clone();
        let working_dir = working_dir.to_path_buf();
        let records = tokio::task::spawn_blocking(move || {
            let mut paths = session_files(&root)?;
            paths.sort();
            paths.reverse();
            Ok::<_, SessionLogError>(
                paths
                    .iter()
                    .filter_map(|path| read_record(path))
                    .filter(|record| record.working_dir.starts_with(&working_dir) && keep(record))
                    .take(limit)
                    .collect::<Vec<_>>(),
            )
        })
        .await??;
        Ok(records)
    }
}

/// `cli` first, newest first within each source group.
pub fn sort_cli_first(records: &mut [SessionRecord]) {
    records.sort_by(|a, b| {
        let a_cli = a.source == SessionSource::Cli;
        let b_cli = b.source == SessionSource::Cli;
        b_cli
            .cmp(&a_cli)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

fn session_files(root: &Path) -> Result<Vec<PathBuf>, SessionLogError> {
    match std::fs::metadata(root) {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SessionLogError::Io {
                path: root.to_path_buf(),
                source,
            });
        }
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable session path");
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "jsonl")
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn file_name_contains(path: &Path, id: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(id))
}

fn read_record(path: &Path) -> Option<SessionRecord> {
    let head = match read_head(path) {
        Ok(head) => head,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "failed to read session head");
            return None;
        }
    };
    let mut lines = head
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());
    let first: Value = serde_json::from_str(lines.next()?).ok()?;
    let mut record = parse_session_meta(&first)?;
    record.display_name =
        first_user_message(lines).unwrap_or_else(|| record.id.chars().take(ID_PREFIX_CHARS).collect());
    record.backing_file = Some(path.to_path_buf());
    Some(record)
}

fn read_head(path: &Path) -> std::io::Result<String> {
    let mut buf = Vec::new();
    File::open(path)?.take(HEAD_BYTES).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Accepts both the flat layout and the one that nests fields under
/// `payload`.
fn parse_session_meta(line: &Value) -> Option<SessionRecord> {
    if line.get("type").and_then(Value::as_str) != Some("session_meta") {
        return None;
    }
    let meta = line
        .get("payload")
        .filter(|payload| payload.is_object())
        .unwrap_or(line);

    let id = meta.get("id").and_then(Value::as_str)?;
    if !is_session_id(id) {
        return None;
    }
    let created_at = meta
        .get("timestamp")
        .or_else(|| line.get("timestamp"))
        .and_then(parse_timestamp)?;
    let working_dir = PathBuf::from(meta.get("cwd").and_then(Value::as_str)?);
    let source = match meta.get("source") {
        Some(Value::String(raw)) => SessionSource::parse(raw),
        _ => SessionSource::Unknown,
    };

    Some(SessionRecord {
        id: id.to_string(),
        created_at,
        working_dir,
        source,
        display_name: String::new(),
        backing_file: None,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => Utc.timestamp_opt(number.as_i64()?, 0).single(),
        _ => None,
    }
}

fn first_user_message<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    for line in lines {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            // The head window may cut the last line in half.
            continue;
        };
        if let Some(text) = user_text(&value) {
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            // Injected context blocks are wrapped in tags; they are not what
            // the person typed.
            if !text.is_empty() && !text.starts_with('<') {
                return Some(text.chars().take(DISPLAY_NAME_CHARS).collect());
            }
        }
    }
    None
}

fn user_text(value: &Value) -> Option<String> {
    let payload = value.get("payload")?;
    match (
        value.get("type").and_then(Value::as_str),
        payload.get("type").and_then(Value::as_str),
    ) {
        (Some("event_msg"), Some("user_message")) => payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        (Some("response_item"), Some("message"))
            if payload.get("role").and_then(Value::as_str) == Some("user") =>
        {
            let parts = payload.get("content")?.as_array()?;
            let text = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            Some(text)
        }
        _ => None,
    }
}
