//! Relational thread index maintained by the agent CLI next to its session
//! logs. It may lag behind the logs, so it is only ever a fallback.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::types::Value as SqlValue;
use thiserror::Error;

use crate::sessions::SessionRecord;
use crate::sessions::SessionSource;
use crate::sessions::is_session_id;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("thread index query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("thread index task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ThreadIndex {
    db_path: PathBuf,
}

impl ThreadIndex {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Threads for exactly `working_dir` created at or after `since`, newest
    /// first. A missing database or `threads` table yields nothing.
    pub async fn list_threads(
        &self,
        working_dir: &Path,
        since: DateTime<Utc>,
        source: Option<SessionSource>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, IndexError> {
        let db_path = self.db_path.clone();
        let working_dir = working_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            query_threads(&db_path, &working_dir, since, source, limit)
        })
        .await?
    }
}

fn query_threads(
    db_path: &Path,
    working_dir: &Path,
    since: DateTime<Utc>,
    source: Option<SessionSource>,
    limit: usize,
) -> Result<Vec<SessionRecord>, IndexError> {
    if !db_path.exists() {
        tracing::debug!(db = %db_path.display(), "thread index not present");
        return Ok(Vec::new());
    }
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let mut sql = String::from(
        "SELECT id, source, cwd, title, created_at, updated_at FROM threads \
         WHERE cwd = ?1 AND created_at >= ?2",
    );
    let mut params: Vec<SqlValue> = vec![
        SqlValue::Text(working_dir.to_string_lossy().into_owned()),
        SqlValue::Integer(since.timestamp()),
    ];
    if let Some(source) = source {
        sql.push_str(" AND source = ?3");
        params.push(SqlValue::Text(source.as_str().to_string()));
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(err) if is_missing_table(&err) => {
            tracing::warn!(db = %db_path.display(), "thread index has no threads table");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, source, cwd, title, created_at) = row?;
        if !is_session_id(&id) {
            continue;
        }
        let Some(created_at) = Utc.timestamp_opt(created_at, 0).single() else {
            continue;
        };
        let display_name = title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| id.chars().take(8).collect());
        records.push(SessionRecord {
            id,
            created_at,
            working_dir: PathBuf::from(cwd),
            source: source
                .as_deref()
                .map_or(SessionSource::Unknown, SessionSource::parse),
            display_name,
            backing_file: None,
        });
        if records.len() >= limit {
            break;
        }
    }
    Ok(records)
}

fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("no such table"))
}
