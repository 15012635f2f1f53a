//! Server-initiated JSON-RPC notifications.
//!
//! The engine publishes command status, heartbeat, recovery, and health
//! events through a transport-agnostic [`NotificationBridge`]. Payloads are
//! typed and serialized camelCase; the hub composes them and delegates to the
//! bridge. Bridge failures are logged and swallowed -- a broken notification
//! channel must never take a command worker down with it.

use crate::command::CommandState;
use crate::output;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const METHOD_COMMAND_STATUS: &str = "notifications/commandStatus";
pub const METHOD_COMMAND_HEARTBEAT: &str = "notifications/commandHeartbeat";
pub const METHOD_SESSION_RECOVERY: &str = "notifications/sessionRecovery";
pub const METHOD_SERVER_HEALTH: &str = "notifications/serverHealth";
pub const METHOD_TOOLS_LIST_CHANGED: &str = "notifications/tools/listChanged";
pub const METHOD_RESOURCES_LIST_CHANGED: &str = "notifications/resources/listChanged";

/// A JSON-RPC 2.0 notification frame (no `id`).
#[derive(Debug, Clone, Serialize)]
pub struct McpNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl McpNotification {
    fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// Transport hook the hub delivers frames to.
#[async_trait]
pub trait NotificationBridge: Send + Sync {
    async fn send(&self, notification: McpNotification) -> Result<(), String>;
}

/// Bridge that hands frames to an in-process consumer over a channel. The
/// transport layer drains the receiver; if it has gone away, sends fail and
/// the hub logs them.
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<McpNotification>,
}

impl ChannelBridge {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<McpNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationBridge for ChannelBridge {
    async fn send(&self, notification: McpNotification) -> Result<(), String> {
        self.tx
            .send(notification)
            .map_err(|_| "notification consumer has shut down".to_string())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusParams {
    pub session_id: String,
    pub command_id: String,
    pub command: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHeartbeatParams {
    pub session_id: String,
    pub command_id: String,
    pub command: String,
    pub elapsed_seconds: f64,
    pub elapsed_display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecoveryParams {
    pub reason: String,
    pub recovery_step: &'static str,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_commands: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthParams {
    pub status: &'static str,
    pub cdb_session_active: bool,
    pub queue_size: usize,
    pub active_commands: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Composes typed payloads and fans them out through the bridge.
pub struct NotificationHub {
    bridge: Arc<dyn NotificationBridge>,
}

impl NotificationHub {
    #[must_use]
    pub fn new(bridge: Arc<dyn NotificationBridge>) -> Self {
        Self { bridge }
    }

    /// Serialize and deliver one frame; failures are logged, never returned.
    async fn publish<T: Serialize>(&self, method: &str, params: &T) {
        let params = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(method, error = %e, "failed to serialize notification");
                return;
            }
        };
        if let Err(e) = self.bridge.send(McpNotification::new(method, params)).await {
            tracing::warn!(method, error = %e, "notification send failed");
        }
    }

    pub async fn command_status(&self, params: CommandStatusParams) {
        self.publish(METHOD_COMMAND_STATUS, &params).await;
    }

    pub async fn command_heartbeat(&self, params: CommandHeartbeatParams) {
        self.publish(METHOD_COMMAND_HEARTBEAT, &params).await;
    }

    pub async fn session_recovery(&self, params: SessionRecoveryParams) {
        self.publish(METHOD_SESSION_RECOVERY, &params).await;
    }

    pub async fn server_health(&self, params: ServerHealthParams) {
        self.publish(METHOD_SERVER_HEALTH, &params).await;
    }

    pub async fn tools_list_changed(&self) {
        self.publish(METHOD_TOOLS_LIST_CHANGED, &serde_json::json!({}))
            .await;
    }

    pub async fn resources_list_changed(&self) {
        self.publish(METHOD_RESOURCES_LIST_CHANGED, &serde_json::json!({}))
            .await;
    }
}

/// Build a command-status payload for a state transition.
///
/// Progress maps the lifecycle onto 0..=100: queued 0, executing 10,
/// terminal 100. The full output rides along on terminal transitions.
#[must_use]
pub fn status_for_transition(
    session_id: &str,
    command_id: &str,
    command: &str,
    state: CommandState,
    error: Option<String>,
    result: Option<String>,
    timestamp: DateTime<Utc>,
) -> CommandStatusParams {
    let progress = match state {
        CommandState::Queued => 0,
        CommandState::Executing => 10,
        _ => 100,
    };
    CommandStatusParams {
        session_id: session_id.to_string(),
        command_id: command_id.to_string(),
        command: command.to_string(),
        status: state.label(),
        result,
        progress,
        message: None,
        error,
        timestamp,
    }
}

/// Build a heartbeat payload for an executing command.
#[must_use]
pub fn heartbeat(
    session_id: &str,
    command_id: &str,
    command: &str,
    elapsed_seconds: f64,
    timestamp: DateTime<Utc>,
) -> CommandHeartbeatParams {
    CommandHeartbeatParams {
        session_id: session_id.to_string(),
        command_id: command_id.to_string(),
        command: command.to_string(),
        elapsed_seconds,
        elapsed_display: output::format_elapsed(elapsed_seconds as u64),
        details: None,
        timestamp,
    }
}
