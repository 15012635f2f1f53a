//! Tests for the process session: startup, sentinel framing, cancellation,
//! restart, and teardown.

mod common;

use cdbsh::error::EngineError;
use cdbsh::process::{ExecVerdict, FaultReason, ProcessSession, ProcessStatus};
use cdbsh::sys::SpawnSpec;
use common::{ChildBehavior, ScriptedProcessManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn spec() -> SpawnSpec {
    SpawnSpec {
        program: PathBuf::from(common::CDB),
        args: vec!["-z".to_string(), common::DUMP.to_string()],
        cwd: None,
        env: Vec::new(),
    }
}

fn session_with(proc: Arc<ScriptedProcessManager>) -> Arc<ProcessSession> {
    Arc::new(ProcessSession::new(
        "sess-test-1".to_string(),
        spec(),
        Arc::new(common::test_config()),
        proc,
    ))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_reaches_idle() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();
    assert_eq!(ps.status(), ProcessStatus::Idle);
    assert!(ps.is_alive());
    assert_eq!(ps.pid(), Some(4242));
    ps.stop().await;
}

#[tokio::test]
async fn test_silent_child_fails_startup() {
    let ps = session_with(ScriptedProcessManager::with_behaviors(&[
        ChildBehavior::Silent,
    ]));
    let err = ps.start().await.unwrap_err();
    assert!(matches!(err, EngineError::StartupFailed(_)));
    assert_eq!(ps.status(), ProcessStatus::Exited);
}

#[tokio::test]
async fn test_spawn_error_fails_startup() {
    let ps = session_with(ScriptedProcessManager::with_behaviors(&[
        ChildBehavior::SpawnError,
    ]));
    let err = ps.start().await.unwrap_err();
    assert!(matches!(err, EngineError::StartupFailed(_)));
}

#[tokio::test]
async fn test_double_start_rejected() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();
    assert!(ps.start().await.is_err());
    ps.stop().await;
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_execute_one_returns_framed_output() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    let outcome = ps.execute_one("lm", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Completed);
    assert_eq!(outcome.output, "executed: lm");
    assert_eq!(ps.status(), ProcessStatus::Idle);
    ps.stop().await;
}

#[tokio::test]
async fn test_execute_sequentially_reuses_the_child() {
    let proc = ScriptedProcessManager::normal();
    let ps = session_with(proc.clone());
    ps.start().await.unwrap();

    for cmd in ["lm", "kL", "r"] {
        let outcome = ps.execute_one(cmd, &CancellationToken::new()).await;
        assert_eq!(outcome.verdict, ExecVerdict::Completed);
        assert_eq!(outcome.output, format!("executed: {cmd}"));
    }
    assert_eq!(proc.spawns(), 1);
    ps.stop().await;
}

#[tokio::test]
async fn test_multi_line_output_accumulates_in_order() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    let outcome = ps.execute_one("emit 5", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Completed);
    let lines: Vec<&str> = outcome.output.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "output line 0");
    assert_eq!(lines[4], "output line 4");
    ps.stop().await;
}

#[tokio::test]
async fn test_output_cap_overflows() {
    let mut config = common::test_config();
    config.max_output_bytes = 64;
    let ps = Arc::new(ProcessSession::new(
        "sess-test-1".to_string(),
        spec(),
        Arc::new(config),
        ScriptedProcessManager::normal(),
    ));
    ps.start().await.unwrap();

    let outcome = ps.execute_one("emit 100", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Overflow);
    // Still drained to the end marker, so the session stays usable.
    assert_eq!(ps.status(), ProcessStatus::Idle);
    let outcome = ps.execute_one("lm", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Completed);
    ps.stop().await;
}

#[tokio::test]
async fn test_child_exit_mid_command() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    let outcome = ps.execute_one("exit", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::ChildExited);
    assert_eq!(ps.status(), ProcessStatus::Exited);
    assert!(!ps.is_alive());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_with_responsive_child_is_clean() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    let token = CancellationToken::new();
    let exec = {
        let ps = ps.clone();
        let token = token.clone();
        tokio::spawn(async move { ps.execute_one("spin", &token).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let outcome = exec.await.unwrap();
    assert_eq!(outcome.verdict, ExecVerdict::InterruptedClean);
    // The interrupt landed; the process is idle and reusable.
    assert_eq!(ps.status(), ProcessStatus::Idle);
    let outcome = ps.execute_one("lm", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Completed);
    ps.stop().await;
}

#[tokio::test]
async fn test_cancel_with_deaf_child_reports_hung() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    let token = CancellationToken::new();
    let exec = {
        let ps = ps.clone();
        let token = token.clone();
        tokio::spawn(async move { ps.execute_one("hang", &token).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let outcome = exec.await.unwrap();
    assert_eq!(outcome.verdict, ExecVerdict::InterruptedHung);

    // The caller decides the fault; the supervisor consumes it.
    ps.mark_hung(FaultReason::CommandTimedOut);
    assert_eq!(ps.status(), ProcessStatus::Hung);
    assert_eq!(ps.take_fault(), Some(FaultReason::CommandTimedOut));
    assert_eq!(ps.take_fault(), None);
    ps.stop().await;
}

// ---------------------------------------------------------------------------
// Restart / stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_restart_replaces_the_child() {
    let proc = ScriptedProcessManager::normal();
    let ps = session_with(proc.clone());
    ps.start().await.unwrap();

    let outcome = ps.execute_one("exit", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::ChildExited);

    ps.restart().await.unwrap();
    assert_eq!(ps.status(), ProcessStatus::Idle);
    assert_eq!(proc.spawns(), 2);

    let outcome = ps.execute_one("lm", &CancellationToken::new()).await;
    assert_eq!(outcome.verdict, ExecVerdict::Completed);
    ps.stop().await;
}

#[tokio::test]
async fn test_stop_is_graceful_and_idempotent() {
    let ps = session_with(ScriptedProcessManager::normal());
    ps.start().await.unwrap();

    ps.stop().await;
    assert_eq!(ps.status(), ProcessStatus::Exited);
    assert!(!ps.is_alive());

    // A second stop is a no-op.
    ps.stop().await;
    assert_eq!(ps.status(), ProcessStatus::Exited);
}

#[tokio::test]
async fn test_status_subscription_sees_transitions() {
    let ps = session_with(ScriptedProcessManager::normal());
    let mut rx = ps.subscribe_status();
    assert_eq!(*rx.borrow_and_update(), ProcessStatus::Starting);

    ps.start().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), ProcessStatus::Idle);
    ps.stop().await;
}
