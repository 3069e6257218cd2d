//! Figures out which newly created session belongs to a turn.
//!
//! Strategies are tried in order. The first one with a single candidate
//! wins, unless an earlier strategy was ambiguous: then the single candidate
//! must also have been one of the earlier candidates. More than one plausible
//! session is reported as ambiguous and never guessed.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::clock::Clock;
use crate::index::ThreadIndex;
use crate::sessions::SessionLog;
use crate::sessions::SessionRecord;
use crate::sessions::SessionSource;
use crate::sessions::Snapshot;

#[derive(Debug, Clone, Copy)]
pub struct ResolutionQuery<'a> {
    pub working_dir: &'a Path,
    pub previous_ids: &'a HashSet<String>,
    pub since: DateTime<Utc>,
    pub limit: usize,
}

impl<'a> ResolutionQuery<'a> {
    pub fn from_snapshot(working_dir: &'a Path, snapshot: &'a Snapshot, limit: usize) -> Self {
        Self {
            working_dir,
            previous_ids: &snapshot.previous_ids,
            since: snapshot.started_at,
            limit,
        }
    }
}

/// What a single strategy saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub found: Option<SessionRecord>,
    pub ambiguous: bool,
    pub candidates: Vec<SessionRecord>,
}

impl Resolution {
    pub fn from_candidates(candidates: Vec<SessionRecord>) -> Self {
        match candidates.as_slice() {
            [] => Self::default(),
            [only] => Self {
                found: Some(only.clone()),
                ambiguous: false,
                candidates,
            },
            _ => Self {
                found: None,
                ambiguous: true,
                candidates,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Found(SessionRecord),
    NotFound,
    Ambiguous(Vec<SessionRecord>),
}

#[async_trait]
pub trait ResolverStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, query: &ResolutionQuery<'_>) -> Resolution;
}

/// Every session created since the snapshot, any source.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    log: SessionLog,
}

impl SnapshotDiff {
    pub fn new(log: SessionLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ResolverStrategy for SnapshotDiff {
    fn name(&self) -> &'static str {
        "snapshot_diff"
    }

    async fn resolve(&self, query: &ResolutionQuery<'_>) -> Resolution {
        match self
            .log
            .find_newest_diff(query.working_dir, query.previous_ids, query.since, query.limit)
            .await
        {
            Ok(candidates) => Resolution::from_candidates(candidates),
            Err(err) => {
                tracing::warn!(error = %err, "session diff failed");
                Resolution::default()
            }
        }
    }
}

/// Only user-visible `cli` sessions created since the snapshot.
#[derive(Debug, Clone)]
pub struct VisibleSince {
    log: SessionLog,
}

impl VisibleSince {
    pub fn new(log: SessionLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ResolverStrategy for VisibleSince {
    fn name(&self) -> &'static str {
        "visible_since"
    }

    async fn resolve(&self, query: &ResolutionQuery<'_>) -> Resolution {
        match self
            .log
            .list_sessions_since(query.working_dir, query.since, query.limit)
            .await
        {
            Ok(records) => Resolution::from_candidates(
                records
                    .into_iter()
                    .filter(|record| {
                        record.source == SessionSource::Cli
                            && !query.previous_ids.contains(&record.id)
                    })
                    .collect(),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "listing recent sessions failed");
                Resolution::default()
            }
        }
    }
}

/// The relational index. A stale or missing index yields no candidates.
#[derive(Debug, Clone)]
pub struct IndexFallback {
    index: ThreadIndex,
}

impl IndexFallback {
    pub fn new(index: ThreadIndex) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ResolverStrategy for IndexFallback {
    fn name(&self) -> &'static str {
        "thread_index"
    }

    async fn resolve(&self, query: &ResolutionQuery<'_>) -> Resolution {
        match self
            .index
            .list_threads(query.working_dir, query.since, None, query.limit)
            .await
        {
            Ok(records) => Resolution::from_candidates(
                records
                    .into_iter()
                    .filter(|record| !query.previous_ids.contains(&record.id))
                    .collect(),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "thread index lookup failed");
                Resolution::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 16,
            interval: Duration::from_millis(250),
        }
    }
}

pub struct SessionResolver {
    strategies: Vec<Box<dyn ResolverStrategy>>,
}

impl SessionResolver {
    pub fn new(strategies: Vec<Box<dyn ResolverStrategy>>) -> Self {
        Self { strategies }
    }

    /// Session diff, then visible `cli` sessions, then the index if there
    /// is one.
    pub fn standard(log: SessionLog, index: Option<ThreadIndex>) -> Self {
        let mut strategies: Vec<Box<dyn ResolverStrategy>> = vec![
            Box::new(SnapshotDiff::new(log.clone())),
            Box::new(VisibleSince::new(log)),
        ];
        if let Some(index) = index {
            strategies.push(Box::new(IndexFallback::new(index)));
        }
        Self::new(strategies)
    }

    pub async fn resolve_once(&self, query: &ResolutionQuery<'_>) -> ResolveOutcome {
        let mut ambiguous: Option<Vec<SessionRecord>> = None;
        for strategy in &self.strategies {
            let resolution = strategy.resolve(query).await;
            tracing::debug!(
                strategy = strategy.name(),
                candidates = resolution.candidates.len(),
                ambiguous = resolution.ambiguous,
                "resolution attempt"
            );
            if let Some(found) = resolution.found {
                let confirmed = ambiguous.as_ref().is_none_or(|earlier| {
                    earlier.iter().any(|candidate| candidate.id == found.id)
                });
                if confirmed {
                    return ResolveOutcome::Found(found);
                }
            } else if resolution.ambiguous && ambiguous.is_none() {
                ambiguous = Some(resolution.candidates);
            }
        }
        match ambiguous {
            Some(candidates) => ResolveOutcome::Ambiguous(candidates),
            None => ResolveOutcome::NotFound,
        }
    }

    /// Retries while nothing is found, since the CLI may write its session
    /// log a moment after the process exits. Ambiguity ends the loop.
    pub async fn poll(
        &self,
        query: &ResolutionQuery<'_>,
        policy: RetryPolicy,
        clock: &dyn Clock,
    ) -> ResolveOutcome {
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = self.resolve_once(query).await;
            if outcome != ResolveOutcome::NotFound {
                tracing::debug!(attempt, "session resolution settled");
                return outcome;
            }
            if attempt < attempts {
                clock.sleep(policy.interval).await;
            }
        }
        ResolveOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn record(id: &str, source: SessionSource) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            created_at: Utc.timestamp_opt(200, 0).single().expect("ts"),
            working_dir: PathBuf::from("/proj"),
            source,
            display_name: id.to_string(),
            backing_file: None,
        }
    }

    /// Returns the next canned candidate list on every call.
    struct Canned {
        name: &'static str,
        answers: Mutex<Vec<Vec<SessionRecord>>>,
    }

    impl Canned {
        fn boxed(name: &'static str, answers: Vec<Vec<SessionRecord>>) -> Box<dyn ResolverStrategy> {
            Box::new(Self {
                name,
                answers: Mutex::new(answers),
            })
        }
    }

    #[async_trait]
    impl ResolverStrategy for Canned {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _query: &ResolutionQuery<'_>) -> Resolution {
            let mut answers = self.answers.lock().expect("lock");
            let next = if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers.first().cloned().unwrap_or_default()
            };
            Resolution::from_candidates(next)
        }
    }

    struct NoWait;

    #[async_trait]
    impl Clock for NoWait {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        async fn sleep(&self, _duration: Duration) {}
    }

    fn query(previous: &HashSet<String>) -> ResolutionQuery<'_> {
        ResolutionQuery {
            working_dir: Path::new("/proj"),
            previous_ids: previous,
            since: Utc.timestamp_opt(150, 0).single().expect("ts"),
            limit: 20,
        }
    }

    #[tokio::test]
    async fn single_candidate_resolves() {
        let resolver = SessionResolver::new(vec![Canned::boxed(
            "diff",
            vec![vec![record("a", SessionSource::Exec)]],
        )]);
        let previous = HashSet::new();
        assert_eq!(
            resolver.resolve_once(&query(&previous)).await,
            ResolveOutcome::Found(record("a", SessionSource::Exec))
        );
    }

    #[tokio::test]
    async fn later_tier_breaks_ties_among_earlier_candidates() {
        let resolver = SessionResolver::new(vec![
            Canned::boxed(
                "diff",
                vec![vec![
                    record("cli", SessionSource::Cli),
                    record("exec", SessionSource::Exec),
                ]],
            ),
            Canned::boxed("visible", vec![vec![record("cli", SessionSource::Cli)]]),
        ]);
        let previous = HashSet::new();
        assert_eq!(
            resolver.resolve_once(&query(&previous)).await,
            ResolveOutcome::Found(record("cli", SessionSource::Cli))
        );
    }

    #[tokio::test]
    async fn unrelated_later_candidate_stays_ambiguous() {
        let earlier = vec![
            record("one", SessionSource::Exec),
            record("two", SessionSource::Exec),
        ];
        let resolver = SessionResolver::new(vec![
            Canned::boxed("diff", vec![earlier.clone()]),
            Canned::boxed("visible", vec![vec![]]),
            Canned::boxed("index", vec![vec![record("three", SessionSource::Cli)]]),
        ]);
        let previous = HashSet::new();
        assert_eq!(
            resolver.resolve_once(&query(&previous)).await,
            ResolveOutcome::Ambiguous(earlier)
        );
    }

    #[tokio::test]
    async fn empty_everywhere_is_not_found() {
        let resolver = SessionResolver::new(vec![
            Canned::boxed("diff", vec![vec![]]),
            Canned::boxed("index", vec![vec![]]),
        ]);
        let previous = HashSet::new();
        assert_eq!(
            resolver.resolve_once(&query(&previous)).await,
            ResolveOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn poll_retries_until_a_session_shows_up() {
        let resolver = SessionResolver::new(vec![Canned::boxed(
            "diff",
            vec![vec![], vec![], vec![record("late", SessionSource::Cli)]],
        )]);
        let previous = HashSet::new();
        let policy = RetryPolicy {
            attempts: 5,
            interval: Duration::from_millis(250),
        };
        assert_eq!(
            resolver.poll(&query(&previous), policy, &NoWait).await,
            ResolveOutcome::Found(record("late", SessionSource::Cli))
        );
    }

    #[tokio::test]
    async fn poll_gives_up_after_the_last_attempt() {
        let resolver = SessionResolver::new(vec![Canned::boxed("diff", vec![vec![]])]);
        let previous = HashSet::new();
        let policy = RetryPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        };
        assert_eq!(
            resolver.poll(&query(&previous), policy, &NoWait).await,
            ResolveOutcome::NotFound
        );
    }
}
