//! Runs agent CLIs under a pseudo-terminal and enforces timeout,
//! cancellation and output-size limits with graduated signal escalation.

mod cancel;
mod errors;
mod escalation;
mod terminal_queries;

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use portable_pty::ExitStatus;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use cancel::AbortReason;
pub use cancel::TurnCancellation;
pub use errors::CapturedOutput;
pub use errors::ProcessError;
pub use errors::StopReason;

use escalation::escalation_plan;
use escalation::spawn_escalation;
use escalation::terminate_leftovers;
use terminal_queries::TerminalQueryResponder;

/// How long output is still collected after the child exits. A grandchild
/// that inherited the pty must not keep the call open.
const POST_EXIT_DRAIN: Duration = Duration::from_millis(250);
const READ_CHUNK_BYTES: usize = 8192;
const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub max_buffer_bytes: usize,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cancel: TurnCancellation,
}

/// Something that can run a shell command line to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, options: RunOptions) -> Result<String, ProcessError>;
}

#[derive(Debug, Clone)]
pub struct PtySupervisor {
    shell: String,
}

impl Default for PtySupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl PtySupervisor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for PtySupervisor {
    async fn run(&self, command: &str, options: RunOptions) -> Result<String, ProcessError> {
        let child = spawn_pty_child(&self.shell, command, &options)?;
        supervise(child, options).await
    }
}

#[derive(Debug)]
struct OutputCapture {
    bytes: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl OutputCapture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    /// Appends what still fits under the limit. Returns true the first time
    /// the limit is crossed.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() <= room {
            self.bytes.extend_from_slice(chunk);
            return false;
        }
        self.bytes.extend_from_slice(&chunk[..room]);
        let first = !self.overflowed;
        self.overflowed = true;
        first
    }

    fn into_output(self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.bytes).into_owned(),
            stderr: String::new(),
        }
    }
}

type PtyWriter = Arc<StdMutex<Box<dyn Write + Send>>>;

struct PtyChild {
    pid: Option<u32>,
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    // Dropping the master writer sends EOF to the child, so it lives until exit.
    writer: PtyWriter,
    master: Box<dyn portable_pty::MasterPty + Send>,
    output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    exit_rx: oneshot::Receiver<std::io::Result<ExitStatus>>,
    exited: Arc<AtomicBool>,
}

fn spawn_pty_child(
    shell: &str,
    command: &str,
    options: &RunOptions,
) -> Result<PtyChild, ProcessError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(ProcessError::spawn)?;

    let mut builder = CommandBuilder::new(shell);
    builder.arg("-c");
    builder.arg(command);
    builder.cwd(&options.cwd);
    builder.env("TERM", "xterm-256color");
    for (key, value) in &options.env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(ProcessError::spawn)?;
    // Only the child may hold the slave side, otherwise reads never see EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    tracing::debug!(?pid, cwd = %options.cwd.display(), "spawned pty child");

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(ProcessError::spawn)?;
    let writer = pair.master.take_writer().map_err(ProcessError::spawn)?;

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let exited = Arc::new(AtomicBool::new(false));
    let wait_exited = Arc::clone(&exited);
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let status = child.wait();
        wait_exited.store(true, Ordering::SeqCst);
        let _ = exit_tx.send(status);
    });

    Ok(PtyChild {
        pid,
        killer,
        writer: Arc::new(StdMutex::new(writer)),
        master: pair.master,
        output_rx,
        exit_rx,
        exited,
    })
}

async fn supervise(child: PtyChild, options: RunOptions) -> Result<String, ProcessError> {
    let PtyChild {
        pid,
        killer,
        writer,
        master,
        mut output_rx,
        mut exit_rx,
        exited,
    } = child;

    let mut capture = OutputCapture::new(options.max_buffer_bytes);
    let mut responder = TerminalQueryResponder::default();
    let mut killer = Some(killer);
    let mut stop: Option<StopReason> = None;
    let mut escalation: Option<JoinHandle<()>> = None;
    let mut output_open = true;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    let mut request_stop = |reason: StopReason, stop: &mut Option<StopReason>| {
        if stop.is_some() {
            return;
        }
        *stop = Some(reason);
        let abort = options.cancel.reason();
        tracing::info!(?pid, ?reason, ?abort, "stopping pty child");
        if let Some(killer) = killer.take() {
            escalation = Some(spawn_escalation(
                escalation_plan(reason, abort),
                pid,
                killer,
                Arc::clone(&exited),
            ));
        }
    };

    let status = loop {
        tokio::select! {
            biased;
            status = &mut exit_rx => break status.ok(),
            chunk = output_rx.recv(), if output_open => match chunk {
                Some(chunk) => {
                    answer_queries(&writer, responder.observe(&chunk)).await;
                    if capture.push(&chunk) {
                        request_stop(StopReason::MaxBuffer, &mut stop);
                    }
                }
                None => output_open = false,
            },
            _ = options.cancel.cancelled(), if stop.is_none() => {
                request_stop(StopReason::Abort, &mut stop);
            }
            _ = &mut deadline, if stop.is_none() => {
                request_stop(StopReason::Timeout, &mut stop);
            }
        }
    };

    if output_open {
        let drain_until = tokio::time::Instant::now() + POST_EXIT_DRAIN;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(drain_until, output_rx.recv()).await {
            capture.push(&chunk);
        }
    }

    if let Some(handle) = escalation.take() {
        handle.abort();
    }
    if status.is_some() {
        terminate_leftovers(pid);
    }
    drop(writer);
    drop(master);

    let output = capture.into_output();
    tracing::debug!(
        ?pid,
        stop_reason = ?stop.unwrap_or(StopReason::NaturalExit),
        bytes = output.stdout.len(),
        "pty child finished"
    );

    if let Some(reason) = stop {
        return Err(ProcessError::Stopped { reason, output });
    }
    match status {
        Some(Ok(status)) if status.success() => Ok(output.stdout),
        Some(Ok(status)) => {
            let signal = status.signal().map(str::to_string);
            let code = if signal.is_some() {
                None
            } else {
                i32::try_from(status.exit_code()).ok()
            };
            Err(ProcessError::Exited {
                code,
                signal,
                output,
            })
        }
        Some(Err(err)) => {
            tracing::warn!(error = %err, "failed to wait for pty child");
            Err(ProcessError::Exited {
                code: None,
                signal: None,
                output,
            })
        }
        None => Err(ProcessError::Exited {
            code: None,
            signal: None,
            output,
        }),
    }
}

async fn answer_queries(writer: &PtyWriter, replies: Vec<&'static [u8]>) {
    if replies.is_empty() {
        return;
    }
    let writer = Arc::clone(writer);
    let _ = tokio::task::spawn_blocking(move || {
        if let Ok(mut guard) = writer.lock() {
            for reply in replies {
                let _ = guard.write_all(reply);
            }
            let _ = guard.flush();
        }
    })
    .await;
}
