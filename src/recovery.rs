//! Supervised recovery of hung or dead debugger processes.
//!
//! One watcher task per session observes the process status channel. When the
//! child hangs or exits outside of a deliberate close, the supervisor cancels
//! whatever was on the wire, restarts the child (bounded attempts), and
//! narrates each step over the notification hub. Queued commands are retained
//! across the restart; executing commands are not retried -- clients
//! resubmit.

use crate::config::EngineConfig;
use crate::notify::{NotificationHub, SessionRecoveryParams};
use crate::process::{FaultReason, ProcessStatus};
use crate::queue::CancelReason;
use crate::session::{Session, SessionState};
use crate::sys::Clock;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawn the recovery watcher for a session.
pub fn spawn_supervisor(
    session: Arc<Session>,
    config: Arc<EngineConfig>,
    hub: Arc<NotificationHub>,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status_rx = session.process.subscribe_status();
        loop {
            let status = *status_rx.borrow_and_update();
            let faulted = matches!(status, ProcessStatus::Hung | ProcessStatus::Exited)
                && !session.closing.is_cancelled();

            // The state transition is the gate: it fails when the session is
            // closing or already failed, in which case we just wait below.
            if faulted && session.set_state(SessionState::Recovering) {
                recover(&session, &config, &hub, clock.as_ref()).await;
                if session.state() == SessionState::Failed {
                    return;
                }
                continue;
            }

            tokio::select! {
                () = session.closing.cancelled() => return,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

async fn recover(
    session: &Arc<Session>,
    config: &EngineConfig,
    hub: &NotificationHub,
    clock: &dyn Clock,
) {
    let reason = session
        .process
        .take_fault()
        .unwrap_or(FaultReason::ProcessExited);

    tracing::warn!(
        session = %session.id,
        reason = reason.as_str(),
        "debugger lost, starting recovery"
    );

    hub.session_recovery(SessionRecoveryParams {
        reason: reason.as_str().to_string(),
        recovery_step: "started",
        success: true,
        message: format!("recovering session {}", session.id),
        affected_commands: None,
        timestamp: clock.now(),
    })
    .await;

    // Cancel whatever is on the wire. Usually the execution already observed
    // the hang/exit and finalized itself; this covers the race where it has
    // not yet.
    let affected = session.queue.cancel_executing(CancelReason::Recovery);

    let mut restarted = false;
    for attempt in 1..=config.max_restart_attempts {
        match session.process.restart().await {
            Ok(()) => {
                restarted = true;
                break;
            }
            Err(e) => {
                tracing::warn!(
                    session = %session.id,
                    attempt,
                    max = config.max_restart_attempts,
                    error = %e,
                    "debugger restart attempt failed"
                );
            }
        }
    }

    if !restarted {
        session.set_state(SessionState::Failed);
        let _ = session.queue.cancel_all(CancelReason::Recovery).await;
        hub.session_recovery(SessionRecoveryParams {
            reason: reason.as_str().to_string(),
            recovery_step: "failed",
            success: false,
            message: format!(
                "giving up after {} restart attempts",
                config.max_restart_attempts
            ),
            affected_commands: non_empty(affected),
            timestamp: clock.now(),
        })
        .await;
        tracing::error!(session = %session.id, "recovery failed, session marked failed");
        return;
    }

    hub.session_recovery(SessionRecoveryParams {
        reason: reason.as_str().to_string(),
        recovery_step: "processRestarted",
        success: true,
        message: "debugger process restarted".to_string(),
        affected_commands: non_empty(affected.clone()),
        timestamp: clock.now(),
    })
    .await;

    // Queued commands survived; the worker resumes them once the process is
    // idle again.
    let retained: Vec<String> = session
        .queue
        .list_infos()
        .into_iter()
        .filter(|c| c.state == crate::command::CommandState::Queued)
        .map(|c| c.command_id)
        .collect();
    if !retained.is_empty() {
        hub.session_recovery(SessionRecoveryParams {
            reason: reason.as_str().to_string(),
            recovery_step: "commandsRequeued",
            success: true,
            message: format!("{} queued commands retained", retained.len()),
            affected_commands: Some(retained),
            timestamp: clock.now(),
        })
        .await;
    }

    session.set_state(SessionState::Ready);
    hub.session_recovery(SessionRecoveryParams {
        reason: reason.as_str().to_string(),
        recovery_step: "succeeded",
        success: true,
        message: format!("session {} recovered", session.id),
        affected_commands: None,
        timestamp: clock.now(),
    })
    .await;
    tracing::info!(session = %session.id, "recovery succeeded");
}

fn non_empty(ids: Vec<String>) -> Option<Vec<String>> {
    if ids.is_empty() { None } else { Some(ids) }
}
