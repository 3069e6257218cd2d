//! One conversation turn against one agent: pick the execution path, run
//! the agent, work out which session it used, and record the link.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::AgentProfile;
use crate::agent::CodexExecClient;
use crate::agent::StreamRequest;
use crate::agent::StreamingClient;
use crate::agent::Transport;
use crate::agent::parse_batch_output;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::RelayConfig;
use crate::error::ErrorKind;
use crate::error::FailureContext;
use crate::error::Result;
use crate::error::TurnError;
use crate::events::EventSink;
use crate::events::ExecutionResult;
use crate::events::ProgressEvent;
use crate::events::TurnPhase;
use crate::index::ThreadIndex;
use crate::pty::CapturedOutput;
use crate::pty::CommandRunner;
use crate::pty::ProcessError;
use crate::pty::PtySupervisor;
use crate::pty::RunOptions;
use crate::pty::StopReason;
use crate::pty::TurnCancellation;
use crate::queue::TurnQueue;
use crate::resolve::IndexFallback;
use crate::resolve::ResolutionQuery;
use crate::resolve::ResolveOutcome;
use crate::resolve::ResolverStrategy;
use crate::resolve::SessionResolver;
use crate::sessions::SessionLog;
use crate::sessions::SessionRecord;
use crate::sessions::SessionSource;
use crate::sessions::Snapshot;
use crate::sessions::is_session_id;
use crate::store::ConversationKey;
use crate::store::ConversationStore;
use crate::store::StoreError;
use crate::store::ThreadKey;

/// Reply used when the interactive CLI was still running at the deadline
/// but had already created its session.
pub const SESSION_CREATED_REPLY: &str =
    "Session created. The agent is still working and will pick up from here on the next message.";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation: ConversationKey,
    pub agent_id: String,
    pub prompt: String,
    /// Overrides the conversation's project directory for this turn.
    pub cwd: Option<PathBuf>,
    pub cancel: TurnCancellation,
}

impl TurnRequest {
    pub fn new(
        conversation: ConversationKey,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            conversation,
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            cwd: None,
            cancel: TurnCancellation::new(),
        }
    }
}

struct AgentRuntime {
    profile: AgentProfile,
    sessions: Option<SessionLog>,
    resolver: SessionResolver,
    streaming: Option<Arc<dyn StreamingClient>>,
}

impl AgentRuntime {
    fn from_profile(profile: AgentProfile) -> Self {
        let sessions = profile.sessions_dir.clone().map(SessionLog::new);
        let index = profile.index_db.clone().map(ThreadIndex::new);
        let streaming: Option<Arc<dyn StreamingClient>> = match profile.transport {
            Transport::Streaming => Some(Arc::new(CodexExecClient::from_profile(&profile))),
            Transport::Pty => None,
        };
        Self {
            resolver: build_resolver(sessions.clone(), index),
            sessions,
            streaming,
            profile,
        }
    }
}

fn build_resolver(sessions: Option<SessionLog>, index: Option<ThreadIndex>) -> SessionResolver {
    match sessions {
        Some(log) => SessionResolver::standard(log, index),
        None => {
            let strategies: Vec<Box<dyn ResolverStrategy>> = index
                .map(|index| Box::new(IndexFallback::new(index)) as Box<dyn ResolverStrategy>)
                .into_iter()
                .collect();
            SessionResolver::new(strategies)
        }
    }
}

/// What a new-session run left behind for resolution.
struct NewRun {
    text: String,
    /// A session id the agent printed itself.
    reported_thread_id: Option<String>,
    timed_out: bool,
}

struct Resolved {
    thread_id: String,
    working_dir: Option<PathBuf>,
    text: String,
    reused_session: bool,
}

pub struct TurnOrchestrator {
    config: RelayConfig,
    store: Arc<dyn ConversationStore>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    agents: HashMap<String, AgentRuntime>,
    queue: TurnQueue<ConversationKey>,
}

impl TurnOrchestrator {
    pub fn new(config: RelayConfig, store: Arc<dyn ConversationStore>) -> Self {
        let agents = config
            .agents
            .iter()
            .map(|(id, profile)| (id.clone(), AgentRuntime::from_profile(profile.clone())))
            .collect();
        Self {
            runner: Arc::new(PtySupervisor::new(config.shell.clone())),
            clock: Arc::new(SystemClock),
            store,
            agents,
            config,
            queue: TurnQueue::new(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Routes `agent_id` through `client` instead of its configured
    /// transport.
    pub fn with_streaming_client(mut self, agent_id: &str, client: Arc<dyn StreamingClient>) -> Self {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.streaming = Some(client);
        }
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Sessions the agent knows about for `working_dir`, newest first.
    pub async fn list_sessions(
        &self,
        agent_id: &str,
        working_dir: &Path,
        limit: usize,
    ) -> Result<Vec<SessionRecord>> {
        let agent = self.agent(agent_id)?;
        match &agent.sessions {
            Some(log) => Ok(log.list_sessions(working_dir, limit).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Queues the turn behind any in-flight turn of the same conversation.
    pub async fn submit(&self, request: TurnRequest, events: &EventSink) -> Result<ExecutionResult> {
        let key = request.conversation.clone();
        self.queue.run(&key, self.run_turn(request, events)).await
    }

    /// Runs a turn immediately. Callers are responsible for serializing
    /// turns of one conversation; [`Self::submit`] does that.
    pub async fn run_turn(&self, request: TurnRequest, events: &EventSink) -> Result<ExecutionResult> {
        let result = self.drive(&request, events).await;
        if let Err(err) = &result {
            tracing::warn!(
                conversation = %request.conversation,
                agent = %request.agent_id,
                kind = %err.kind(),
                error = %err,
                "turn failed"
            );
            events.emit(ProgressEvent::Error {
                kind: err.kind(),
                message: err.user_message(),
            });
        }
        result
    }

    /// Forgets the session linked to the thread.
    pub async fn reset_thread(
        &self,
        conversation: &ConversationKey,
        agent_id: &str,
    ) -> std::result::Result<(), StoreError> {
        let key = conversation.thread(agent_id);
        self.store.clear_thread_state(&key).await;
        tracing::info!(thread_key = %key, "thread reset");
        self.store.persist_threads().await
    }

    fn agent(&self, agent_id: &str) -> Result<&AgentRuntime> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| TurnError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    async fn drive(&self, request: &TurnRequest, events: &EventSink) -> Result<ExecutionResult> {
        let agent = self.agent(&request.agent_id)?;
        let thread_key = request.conversation.thread(&request.agent_id);
        events.status(TurnPhase::Starting);

        let thread_id = self
            .store
            .thread_state(&thread_key)
            .await
            .and_then(|state| state.thread_id);
        let existing = match (&thread_id, &agent.sessions) {
            (Some(thread_id), Some(log)) => log.find_session(thread_id).await?,
            _ => None,
        };
        let working_dir = self
            .resolve_working_dir(request, existing.as_ref())
            .await;

        if let (Some(thread_id), Some(record)) = (&thread_id, &existing)
            && !paths_compatible(&record.working_dir, &working_dir)
        {
            self.store.clear_thread_state(&thread_key).await;
            self.persist_in_background(true, false);
            return Err(TurnError::StaleSession {
                thread_id: thread_id.clone(),
                session_dir: record.working_dir.clone(),
                working_dir,
            });
        }

        tracing::info!(
            thread_key = %thread_key,
            cwd = %working_dir.display(),
            resume = thread_id.is_some(),
            transport = ?agent.profile.transport,
            "starting turn"
        );

        let resolved = match thread_id {
            Some(thread_id) => {
                self.resume(agent, request, &working_dir, &thread_id, events)
                    .await?
            }
            None => {
                let started_at = self.clock.now();
                let snapshot = match &agent.sessions {
                    Some(log) => {
                        log.take_snapshot(&working_dir, started_at, self.config.resolution.list_limit)
                            .await?
                    }
                    None => Snapshot::empty(started_at),
                };
                self.start_new(agent, request, &working_dir, snapshot, events)
                    .await?
            }
        };

        self.reconcile(&thread_key, &request.conversation, &working_dir, &resolved)
            .await;
        events.status(TurnPhase::Completed);
        Ok(ExecutionResult {
            text: resolved.text,
            thread_id: Some(resolved.thread_id),
            conversation_id: Some(request.conversation.to_string()),
            events: events.events(),
            reused_session: resolved.reused_session,
        })
    }

    async fn resolve_working_dir(
        &self,
        request: &TurnRequest,
        existing: Option<&SessionRecord>,
    ) -> PathBuf {
        if let Some(cwd) = &request.cwd {
            return cwd.clone();
        }
        if let Some(cwd) = self.store.project_override(&request.conversation).await {
            return cwd;
        }
        if let Some(record) = existing {
            return record.working_dir.clone();
        }
        self.config.default_cwd.clone()
    }

    async fn resume(
        &self,
        agent: &AgentRuntime,
        request: &TurnRequest,
        working_dir: &Path,
        thread_id: &str,
        events: &EventSink,
    ) -> Result<Resolved> {
        events.status(TurnPhase::Resuming);
        let timeout = self.config.turn_timeout();

        let (text, reported) = match &agent.streaming {
            Some(client) => {
                let outcome = client
                    .run(
                        StreamRequest {
                            prompt: &request.prompt,
                            thread_id: Some(thread_id),
                            cwd: working_dir,
                            timeout,
                            max_buffer_bytes: self.config.max_buffer_bytes,
                            cancel: &request.cancel,
                        },
                        events,
                    )
                    .await?;
                (outcome.text, outcome.thread_id)
            }
            None => {
                let command = command_line(&agent.profile, &request.prompt, Some(thread_id))?;
                let context = FailureContext {
                    timeout_ms: duration_ms(timeout),
                    max_buffer_bytes: self.config.max_buffer_bytes,
                    thread_id: Some(thread_id),
                };
                let stdout = match self
                    .runner
                    .run(&command, self.run_options(agent, request, working_dir, timeout))
                    .await
                {
                    Ok(stdout) => stdout,
                    Err(err) => recover_structured(err, events)
                        .map_err(|err| TurnError::from_process(err, &context))?,
                };
                let parsed = parse_batch_output(&stdout);
                if !parsed.text.is_empty() {
                    events.emit(ProgressEvent::OutputText {
                        text: parsed.text.clone(),
                    });
                }
                (parsed.text, parsed.thread_id)
            }
        };

        let thread_id = match reported {
            Some(reported) if reported != thread_id && is_session_id(&reported) => {
                tracing::warn!(previous = thread_id, reported = %reported, "agent continued in a different session");
                events.emit(ProgressEvent::Session {
                    thread_id: reported.clone(),
                });
                reported
            }
            _ => thread_id.to_string(),
        };
        Ok(Resolved {
            thread_id,
            working_dir: None,
            text,
            reused_session: false,
        })
    }

    async fn start_new(
        &self,
        agent: &AgentRuntime,
        request: &TurnRequest,
        working_dir: &Path,
        snapshot: Snapshot,
        events: &EventSink,
    ) -> Result<Resolved> {
        let run = match &agent.streaming {
            Some(client) => {
                let outcome = client
                    .run(
                        StreamRequest {
                            prompt: &request.prompt,
                            thread_id: None,
                            cwd: working_dir,
                            timeout: self.config.turn_timeout(),
                            max_buffer_bytes: self.config.max_buffer_bytes,
                            cancel: &request.cancel,
                        },
                        events,
                    )
                    .await?;
                if let Some(thread_id) = outcome.thread_id {
                    return Ok(Resolved {
                        thread_id,
                        working_dir: None,
                        text: outcome.text,
                        reused_session: false,
                    });
                }
                tracing::debug!("stream ended without a thread id, resolving from session logs");
                NewRun {
                    text: outcome.text,
                    reported_thread_id: None,
                    timed_out: false,
                }
            }
            None => self.run_new_pty(agent, request, working_dir, events).await?,
        };

        // A timed-out run still has to show a cli session before it counts.
        let reported = run
            .reported_thread_id
            .as_ref()
            .filter(|id| {
                !run.timed_out && is_session_id(id) && !snapshot.previous_ids.contains(id.as_str())
            })
            .cloned();
        if let Some(thread_id) = reported {
            events.emit(ProgressEvent::Session {
                thread_id: thread_id.clone(),
            });
            return Ok(Resolved {
                thread_id,
                working_dir: None,
                text: run.text,
                reused_session: false,
            });
        }

        events.status(TurnPhase::Resolving);
        let query =
            ResolutionQuery::from_snapshot(working_dir, &snapshot, self.config.resolution.list_limit);
        let outcome = agent
            .resolver
            .poll(&query, self.config.retry_policy(), self.clock.as_ref())
            .await;
        finish_new_session(outcome, run, &snapshot, self.config.new_session_timeout(), events)
    }

    async fn run_new_pty(
        &self,
        agent: &AgentRuntime,
        request: &TurnRequest,
        working_dir: &Path,
        events: &EventSink,
    ) -> Result<NewRun> {
        events.status(TurnPhase::Running);
        let timeout = self.config.new_session_timeout();
        let command = command_line(&agent.profile, &request.prompt, None)?;
        let context = FailureContext {
            timeout_ms: duration_ms(timeout),
            max_buffer_bytes: self.config.max_buffer_bytes,
            thread_id: None,
        };

        let (stdout, timed_out) = match self
            .runner
            .run(&command, self.run_options(agent, request, working_dir, timeout))
            .await
        {
            Ok(stdout) => (stdout, false),
            Err(ProcessError::Stopped {
                reason: StopReason::Timeout,
                output,
            }) => {
                tracing::info!(timeout_ms = context.timeout_ms, "new-session run hit its deadline");
                (output.stdout, true)
            }
            Err(err) => (
                recover_structured(err, events).map_err(|err| TurnError::from_process(err, &context))?,
                false,
            ),
        };

        let parsed = parse_batch_output(&stdout);
        if !timed_out && !parsed.text.is_empty() {
            events.emit(ProgressEvent::OutputText {
                text: parsed.text.clone(),
            });
        }
        Ok(NewRun {
            text: parsed.text,
            reported_thread_id: parsed.thread_id,
            timed_out,
        })
    }

    fn run_options(
        &self,
        agent: &AgentRuntime,
        request: &TurnRequest,
        working_dir: &Path,
        timeout: std::time::Duration,
    ) -> RunOptions {
        RunOptions {
            timeout,
            max_buffer_bytes: self.config.max_buffer_bytes,
            cwd: working_dir.to_path_buf(),
            env: agent
                .profile
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            cancel: request.cancel.clone(),
        }
    }

    async fn reconcile(
        &self,
        thread_key: &ThreadKey,
        conversation: &ConversationKey,
        working_dir: &Path,
        resolved: &Resolved,
    ) {
        self.store
            .set_thread_state(thread_key, &resolved.thread_id)
            .await;
        let project_dir = resolved.working_dir.as_deref().unwrap_or(working_dir);
        self.store
            .set_project_override(conversation, project_dir)
            .await;
        self.persist_in_background(true, true);
    }

    /// Persistence never fails a turn; errors are only logged.
    fn persist_in_background(&self, threads: bool, overrides: bool) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if threads && let Err(err) = store.persist_threads().await {
                tracing::warn!(error = %err, "failed to persist thread links");
            }
            if overrides && let Err(err) = store.persist_project_overrides().await {
                tracing::warn!(error = %err, "failed to persist project overrides");
            }
        });
    }
}

fn finish_new_session(
    outcome: ResolveOutcome,
    run: NewRun,
    snapshot: &Snapshot,
    new_session_timeout: std::time::Duration,
    events: &EventSink,
) -> Result<Resolved> {
    match outcome {
        ResolveOutcome::Ambiguous(candidates) => Err(TurnError::AmbiguousResolution { candidates }),
        ResolveOutcome::Found(record) if run.timed_out && record.source != SessionSource::Cli => {
            tracing::debug!(session = %record.id, "only a non-cli session appeared before the deadline");
            Err(TurnError::Timeout {
                timeout_ms: duration_ms(new_session_timeout),
                output: CapturedOutput {
                    stdout: run.text,
                    stderr: String::new(),
                },
            })
        }
        ResolveOutcome::Found(record) => {
            events.emit(ProgressEvent::Session {
                thread_id: record.id.clone(),
            });
            let text = if run.timed_out || run.text.is_empty() {
                SESSION_CREATED_REPLY.to_string()
            } else {
                run.text
            };
            Ok(Resolved {
                thread_id: record.id,
                working_dir: Some(record.working_dir),
                text,
                reused_session: false,
            })
        }
        ResolveOutcome::NotFound if run.timed_out => Err(TurnError::Timeout {
            timeout_ms: duration_ms(new_session_timeout),
            output: CapturedOutput {
                stdout: run.text,
                stderr: String::new(),
            },
        }),
        ResolveOutcome::NotFound => match snapshot.sole_previous_id() {
            Some(previous) => {
                tracing::info!(session = previous, "no new session appeared, reusing the only known one");
                events.warning(format!(
                    "No new session was created; continuing the existing session {previous}."
                ));
                events.emit(ProgressEvent::Session {
                    thread_id: previous.to_string(),
                });
                Ok(Resolved {
                    thread_id: previous.to_string(),
                    working_dir: None,
                    text: run.text,
                    reused_session: true,
                })
            }
            None => Err(TurnError::NoVisibleSession),
        },
    }
}

/// A failed run whose output still holds a structured reply counts as a
/// success.
fn recover_structured(err: ProcessError, events: &EventSink) -> std::result::Result<String, ProcessError> {
    match err {
        ProcessError::Exited { code, output, .. } if parse_batch_output(&output.stdout).structured => {
            tracing::warn!(?code, "agent exited with an error but produced a result");
            events.warning(format!(
                "The agent exited with {} but its reply was recovered.",
                code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
            ));
            Ok(output.stdout)
        }
        other => Err(other),
    }
}

fn command_line(profile: &AgentProfile, prompt: &str, thread_id: Option<&str>) -> Result<String> {
    profile
        .command_line(prompt, thread_id)
        .map_err(|err| TurnError::Agent {
            kind: ErrorKind::Unknown,
            message: format!("cannot build the agent command line: {err}"),
            output: CapturedOutput::default(),
        })
}

/// Same directory, or one nested inside the other.
pub fn paths_compatible(session_dir: &Path, working_dir: &Path) -> bool {
    session_dir.starts_with(working_dir) || working_dir.starts_with(session_dir)
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
