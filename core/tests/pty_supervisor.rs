#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use core_test_support::skip_if_no_pty;
use relay_core::error::ErrorKind;
use relay_core::error::classify;
use relay_core::pty::AbortReason;
use relay_core::pty::CommandRunner;
use relay_core::pty::ProcessError;
use relay_core::pty::PtySupervisor;
use relay_core::pty::RunOptions;
use relay_core::pty::StopReason;
use relay_core::pty::TurnCancellation;
use tempfile::tempdir;

fn options(timeout: Duration, cancel: TurnCancellation) -> RunOptions {
    RunOptions {
        timeout,
        max_buffer_bytes: 1024 * 1024,
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
        cancel,
    }
}

async fn run(command: &str, options: RunOptions) -> Result<String, ProcessError> {
    tokio::time::timeout(
        Duration::from_secs(20),
        PtySupervisor::default().run(command, options),
    )
    .await
    .expect("supervisor must not hang")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_command_resolves_with_output() {
    skip_if_no_pty!();

    let stdout = run(
        "printf 'hello from pty\\n'",
        options(Duration::from_secs(10), TurnCancellation::new()),
    )
    .await
    .expect("command succeeds");
    assert!(stdout.contains("hello from pty"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_in_requested_directory_with_env() {
    skip_if_no_pty!();

    let dir = tempdir().expect("tempdir");
    let mut opts = options(Duration::from_secs(10), TurnCancellation::new());
    opts.cwd = dir.path().to_path_buf();
    opts.env
        .insert("RELAY_TEST_VALUE".to_string(), "xyzzy".to_string());

    let stdout = run("pwd; printf '%s\\n' \"$RELAY_TEST_VALUE\"", opts)
        .await
        .expect("command succeeds");
    let canonical = dir.path().canonicalize().expect("canonical");
    assert!(
        stdout.contains(&*canonical.to_string_lossy())
            || stdout.contains(&*dir.path().to_string_lossy()),
        "stdout: {stdout:?}"
    );
    assert!(stdout.contains("xyzzy"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_keeps_partial_output() {
    skip_if_no_pty!();

    let err = run(
        "printf 'partial\\n'; sleep 60",
        options(Duration::from_millis(100), TurnCancellation::new()),
    )
    .await
    .expect_err("command must time out");
    assert_matches!(
        &err,
        ProcessError::Stopped {
            reason: StopReason::Timeout,
            ..
        }
    );
    let stdout = &err.output().expect("captured output").stdout;
    assert!(stdout.contains("partial"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_over_the_limit_stops_the_process() {
    skip_if_no_pty!();

    let limit = 4096;
    let mut opts = options(Duration::from_secs(15), TurnCancellation::new());
    opts.max_buffer_bytes = limit;

    let err = run("while :; do printf 'abcdefgh\\n'; done", opts)
        .await
        .expect_err("command must be stopped");
    assert_matches!(
        &err,
        ProcessError::Stopped {
            reason: StopReason::MaxBuffer,
            ..
        }
    );
    let stdout = &err.output().expect("captured output").stdout;
    assert_eq!(stdout.len(), limit);
    let expected: String = "abcdefgh\r\n".repeat(limit / 10 + 1);
    assert!(expected.starts_with(stdout.as_str()), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_before_start_still_spawns_and_aborts() {
    skip_if_no_pty!();

    let cancel = TurnCancellation::new();
    cancel.cancel(AbortReason::UserCancelled);

    let err = run("sleep 60", options(Duration::from_secs(10), cancel))
        .await
        .expect_err("command must be aborted");
    assert_matches!(
        err,
        ProcessError::Stopped {
            reason: StopReason::Abort,
            ..
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_run_aborts_with_partial_output() {
    skip_if_no_pty!();

    let cancel = TurnCancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel(AbortReason::UserCancelled);
    });

    let err = run(
        "printf 'working\\n'; sleep 60",
        options(Duration::from_secs(10), cancel),
    )
    .await
    .expect_err("command must be aborted");
    assert_matches!(
        &err,
        ProcessError::Stopped {
            reason: StopReason::Abort,
            ..
        }
    );
    let stdout = &err.output().expect("captured output").stdout;
    assert!(stdout.contains("working"), "stdout: {stdout:?}");
}

const INT_TRAP: &str =
    "trap 'printf \"got int\\n\"; exit 0' INT; printf 'ready\\n'; while :; do sleep 0.1; done";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn soft_abort_interrupts_first() {
    skip_if_no_pty!();

    let cancel = TurnCancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel(AbortReason::SessionDetected);
    });

    let err = run(INT_TRAP, options(Duration::from_secs(10), cancel))
        .await
        .expect_err("command must be aborted");
    let stdout = &err.output().expect("captured output").stdout;
    assert_eq!(err.stop_reason(), Some(StopReason::Abort));
    assert!(stdout.contains("got int"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_abort_skips_the_interrupt() {
    skip_if_no_pty!();

    let cancel = TurnCancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel(AbortReason::UserCancelled);
    });

    let err = run(INT_TRAP, options(Duration::from_secs(10), cancel))
        .await
        .expect_err("command must be aborted");
    let stdout = &err.output().expect("captured output").stdout;
    assert_eq!(err.stop_reason(), Some(StopReason::Abort));
    assert!(!stdout.contains("got int"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_reports_code_and_output() {
    skip_if_no_pty!();

    let err = run(
        "printf 'oops\\n'; exit 3",
        options(Duration::from_secs(10), TurnCancellation::new()),
    )
    .await
    .expect_err("command fails");
    match err {
        ProcessError::Exited { code, output, .. } => {
            assert_eq!(code, Some(3));
            assert!(output.stdout.contains("oops"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_binary_classifies_as_cli_missing() {
    skip_if_no_pty!();

    let err = run(
        "relay-definitely-not-installed --version",
        options(Duration::from_secs(10), TurnCancellation::new()),
    )
    .await
    .expect_err("command fails");
    let ProcessError::Exited { code, output, .. } = err else {
        panic!("expected an exit error");
    };
    assert_eq!(classify(code, &output.combined()), ErrorKind::CliMissing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_shell_is_a_spawn_error() {
    skip_if_no_pty!();

    let err = PtySupervisor::new("/nonexistent/relay-shell")
        .run(
            "true",
            options(Duration::from_secs(5), TurnCancellation::new()),
        )
        .await
        .expect_err("spawn fails");
    assert_matches!(err, ProcessError::Spawn { .. });
    assert!(err.output().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cursor_position_query_is_answered() {
    skip_if_no_pty!();

    // Read the reply byte-wise without echo; a real terminal would answer
    // the same way.
    let stdout = run(
        "stty -icanon -echo min 6 time 50; printf '\\033[6n'; head -c 6 | tr -d '\\033'; printf '\\n'",
        options(Duration::from_secs(10), TurnCancellation::new()),
    )
    .await
    .expect("command succeeds");
    assert!(stdout.contains("[1;1R"), "stdout: {stdout:?}");
}

/// Gone, or a zombie nobody has reaped yet.
#[cfg(target_os = "linux")]
fn has_exited(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_processes_are_terminated_after_exit() {
    skip_if_no_pty!();

    // Ignoring SIGHUP keeps it alive past the session leader.
    let stdout = run(
        "(trap '' HUP; exec sleep 30) & echo \"bg=$!\"",
        options(Duration::from_secs(10), TurnCancellation::new()),
    )
    .await
    .expect("command succeeds");
    let pid = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("bg="))
        .expect("background pid printed")
        .to_string();

    let mut exited = false;
    for _ in 0..30 {
        if has_exited(&pid) {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(exited, "background process {pid} outlived the run");
}
