use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use portable_pty::ChildKiller;
use tokio::task::JoinHandle;

use super::AbortReason;
use super::StopReason;

const INTERRUPT_GRACE: Duration = Duration::from_millis(400);
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Send(Signal),
    Wait(Duration),
}

/// Signals to deliver, in order, once a stop has been requested.
///
/// An abort that only means "the answer is already in" starts with SIGINT so
/// the agent can flush its session log before it is terminated.
pub(crate) fn escalation_plan(reason: StopReason, abort: Option<AbortReason>) -> Vec<Step> {
    let soft = reason == StopReason::Abort && abort.is_some_and(AbortReason::is_soft);
    let mut steps = Vec::with_capacity(5);
    if soft {
        steps.push(Step::Send(Signal::Interrupt));
        steps.push(Step::Wait(INTERRUPT_GRACE));
    }
    steps.push(Step::Send(Signal::Terminate));
    steps.push(Step::Wait(TERMINATE_GRACE));
    steps.push(Step::Send(Signal::Kill));
    steps
}

/// Runs `plan` against the child's process group. Every signal is skipped
/// once `exited` is set.
pub(crate) fn spawn_escalation(
    plan: Vec<Step>,
    pgid: Option<u32>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for step in plan {
            match step {
                Step::Wait(delay) => tokio::time::sleep(delay).await,
                Step::Send(signal) => {
                    if exited.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::debug!(?signal, ?pgid, "signalling pty process group");
                    signal_group(pgid, signal, killer.as_mut());
                }
            }
        }
    })
}

/// Terminates what is left of the group after its leader exited, such as a
/// command the agent put in the background.
#[cfg(unix)]
pub(crate) fn terminate_leftovers(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        tracing::debug!(pgid, "terminated leftover pty processes");
        return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        tracing::warn!(pgid, error = %err, "failed to signal leftover pty processes");
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_leftovers(_pgid: Option<u32>) {}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal, killer: &mut (dyn ChildKiller + Send + Sync)) {
    if let Some(pgid) = pgid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // The pty child is a session leader, so its pid doubles as the group id.
        let rc = unsafe { libc::kill(-pgid, signal.as_raw()) };
        if rc == 0 {
            return;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        tracing::warn!(pgid, ?signal, error = %err, "failed to signal process group");
    }
    if signal != Signal::Interrupt
        && let Err(err) = killer.kill()
    {
        tracing::warn!(error = %err, "failed to kill pty child");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, signal: Signal, killer: &mut (dyn ChildKiller + Send + Sync)) {
    if signal == Signal::Interrupt {
        return;
    }
    if let Err(err) = killer.kill() {
        tracing::warn!(error = %err, "failed to kill pty child");
    }
}
