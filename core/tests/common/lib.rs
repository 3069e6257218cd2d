#![expect(clippy::expect_used)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use relay_core::clock::Clock;
use serde_json::json;

/// Deterministic, version-4 shaped session id.
pub fn session_id(n: u32) -> String {
    format!("00000000-0000-4000-8000-{n:012}")
}

pub fn ts(epoch_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_seconds, 0)
        .single()
        .expect("valid fixture timestamp")
}

/// The metadata line every session log starts with.
#[derive(Debug, Clone)]
pub struct SessionMeta<'a> {
    pub id: &'a str,
    pub created_at: DateTime<Utc>,
    pub cwd: &'a Path,
    pub source: &'a str,
}

/// Writes a session log the way the agent CLI lays them out:
/// `<root>/YYYY/MM/DD/rollout-<timestamp>-<id>.jsonl`.
pub fn write_session_log(
    root: &Path,
    meta: &SessionMeta<'_>,
    first_message: Option<&str>,
) -> anyhow::Result<PathBuf> {
    let day = root.join(meta.created_at.format("%Y/%m/%d").to_string());
    std::fs::create_dir_all(&day)?;
    let path = day.join(format!(
        "rollout-{}-{}.jsonl",
        meta.created_at.format("%Y-%m-%dT%H-%M-%S"),
        meta.id
    ));

    let timestamp = meta.created_at.to_rfc3339();
    let mut lines = vec![json!({
        "timestamp": timestamp,
        "type": "session_meta",
        "payload": {
            "id": meta.id,
            "timestamp": timestamp,
            "cwd": meta.cwd,
            "originator": "codex_cli_rs",
            "source": meta.source,
        }
    })];
    if let Some(message) = first_message {
        lines.push(json!({
            "timestamp": timestamp,
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": message }]
            }
        }));
    }
    let body = lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&path, format!("{body}\n"))?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct ThreadRow<'a> {
    pub id: &'a str,
    pub source: &'a str,
    pub cwd: &'a Path,
    pub title: &'a str,
    pub created_at: i64,
}

/// Creates (or extends) a relational thread index with the given rows.
pub fn write_thread_index(db: &Path, rows: &[ThreadRow<'_>]) -> anyhow::Result<()> {
    let conn = rusqlite::Connection::open(db)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            cwd TEXT NOT NULL,
            title TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    )?;
    for row in rows {
        conn.execute(
            "INSERT INTO threads (id, source, cwd, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![
                row.id,
                row.source,
                row.cwd.to_string_lossy(),
                row.title,
                row.created_at
            ],
        )?;
    }
    Ok(())
}

type SleepHook = Box<dyn Fn(usize) + Send + Sync>;

/// A [`Clock`] whose sleeps return immediately and advance `now`.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: AtomicUsize,
    hook: Option<SleepHook>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
            sleeps: AtomicUsize::new(0),
            hook: None,
        })
    }

    /// Calls `hook` with the 1-based sleep count after every sleep.
    pub fn with_sleep_hook(
        start: DateTime<Utc>,
        hook: impl Fn(usize) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
            sleeps: AtomicUsize::new(0),
            hook: Some(Box::new(hook)),
        })
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::from_std(duration).expect("duration in range");
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        let count = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(count);
        }
        tokio::task::yield_now().await;
    }
}

/// Returns early from a test when no pty can be opened, e.g. in a
/// restricted container.
#[macro_export]
macro_rules! skip_if_no_pty {
    () => {{
        if !$crate::pty_available() {
            eprintln!("no pty available, skipping test.");
            return;
        }
    }};
    ($return_value:expr $(,)?) => {{
        if !$crate::pty_available() {
            eprintln!("no pty available, skipping test.");
            return $return_value;
        }
    }};
}

pub fn pty_available() -> bool {
    cfg!(unix) && Path::new("/dev/ptmx").exists()
}
