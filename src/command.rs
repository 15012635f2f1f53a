//! Command records: lifecycle states, timestamps, and snapshots.
//!
//! A [`Command`] is created on enqueue and lives in its session's queue until
//! the session closes. Terminal states are absorbing; every transition is
//! funneled through [`Command::transition`] so the state machine cannot be
//! bypassed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl CommandState {
    /// Terminal states are absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Lowercase label for logs and notification payloads.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timedOut",
        }
    }
}

/// Format the id of the `n`th command issued on a session.
#[must_use]
pub fn format_command_id(session_id: &str, n: u64) -> String {
    format!("cmd-{session_id}-{n}")
}

/// One queued/executed debugger command, owned by its session's queue.
pub struct Command {
    pub id: String,
    pub text: String,
    pub state: CommandState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error_message: Option<String>,
    /// Set when this command was absorbed into a synthesized batch command.
    pub batch_command_id: Option<String>,
    /// Flips to true exactly once, when the command reaches a terminal state.
    done_tx: watch::Sender<bool>,
}

impl Command {
    #[must_use]
    pub fn new(id: String, text: String, queued_at: DateTime<Utc>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            id,
            text,
            state: CommandState::Queued,
            queued_at,
            started_at: None,
            ended_at: None,
            output: String::new(),
            error_message: None,
            batch_command_id: None,
            done_tx,
        }
    }

    /// Subscribe to terminal-state completion. Waiters see `true` once the
    /// command ends; already-terminal commands observe it immediately.
    #[must_use]
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Apply a state transition. Terminal states are absorbing: a transition
    /// out of one is ignored and reported as `false`.
    pub fn transition(&mut self, next: CommandState, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || self.state == next {
            return false;
        }
        self.state = next;
        match next {
            CommandState::Executing => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.ended_at = Some(now);
                let _ = self.done_tx.send(true);
            }
            _ => {}
        }
        true
    }

    /// Immutable snapshot for external readers.
    #[must_use]
    pub fn info(&self) -> CommandInfo {
        let wait_time = duration_secs(Some(self.queued_at), self.started_at);
        let exec_time = duration_secs(self.started_at, self.ended_at);
        let total_time = duration_secs(Some(self.queued_at), self.ended_at);
        CommandInfo {
            command_id: self.id.clone(),
            command: self.text.clone(),
            state: self.state,
            queued_at: self.queued_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            wait_time,
            exec_time,
            total_time,
            output: self.output.clone(),
            error_message: self.error_message.clone(),
            is_success: if self.state.is_terminal() {
                Some(self.state == CommandState::Completed)
            } else {
                None
            },
            batch_command_id: self.batch_command_id.clone(),
        }
    }
}

/// Seconds between two instants, millisecond precision.
fn duration_secs(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<f64> {
    let (from, to) = (from?, to?);
    let ms = (to - from).num_milliseconds();
    Some(ms as f64 / 1000.0)
}

/// Serializable snapshot of a command, as returned by the engine API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub command_id: String,
    pub command: String,
    pub state: CommandState,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds spent waiting in the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<f64>,
    /// Seconds spent executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_time: Option<f64>,
    /// Seconds from enqueue to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_command_id: Option<String>,
}

/// Pairing of a command id with its share of executed output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub output: String,
}
