//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `CdbshServer` with MCP tools for:
//! - Sessions: `open_dump_session`, `close_dump_session`, `list_dump_sessions`
//! - Commands: `run_debugger_command` (blocking convenience),
//!   `start_debugger_command`, `wait_debugger_command`, `get_command_status`,
//!   `list_session_commands`, `cancel_debugger_command`, `cancel_all_commands`
//!
//! The engine does the real work; this layer only shapes parameters and
//! results for LLM consumption.

use crate::command::CommandInfo;
use crate::engine::DebugEngine;
use crate::output;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::sync::Arc;

/// Default max output lines returned to the agent.
const DEFAULT_MAX_OUTPUT_LINES: usize = 200;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `open_dump_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct OpenDumpSessionParams {
    /// Path to the crash dump file (.dmp) to analyze.
    pub dump_path: String,
    /// Symbol search path (e.g. `srv*c:\symbols*https://msdl.microsoft.com/download/symbols`).
    /// Defaults to the server's configured symbol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols_path: Option<String>,
}

/// Parameters for the `close_dump_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CloseDumpSessionParams {
    /// ID of the session to close.
    pub session_id: String,
}

/// Parameters for the `run_debugger_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunDebuggerCommandParams {
    /// ID of the session to run in.
    pub session_id: String,
    /// The debugger command to execute (e.g. `lm`, `kL`, `!analyze -v`).
    pub command: String,
    /// Maximum number of output lines to return. Defaults to 200.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_lines: Option<usize>,
}

/// Parameters for the `start_debugger_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct StartDebuggerCommandParams {
    /// ID of the session to run in.
    pub session_id: String,
    /// The debugger command to enqueue.
    pub command: String,
}

/// Parameters for tools addressing one command.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandRefParams {
    /// ID of the session the command belongs to.
    pub session_id: String,
    /// ID of the command (as returned by start_debugger_command).
    pub command_id: String,
    /// Maximum number of output lines to return. Defaults to 200.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_lines: Option<usize>,
}

/// Parameters for tools addressing one session.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SessionRefParams {
    /// ID of the session.
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Result structs (serialized to JSON and returned as tool content)
// ---------------------------------------------------------------------------

/// Structured result of a debugger command, optimized for LLM consumption.
///
/// The full output is retained on the command record; `get_command_status`
/// with a larger `max_output_lines` retrieves more of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerCommandResult {
    pub session_id: String,
    pub command_id: String,
    pub command: String,
    pub state: crate::command::CommandState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_time: Option<f64>,
    pub output_head: Vec<String>,
    pub output_tail: Vec<String>,
    pub output_error_lines: Vec<String>,
    pub total_lines: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_command_id: Option<String>,
}

/// Result of enqueueing a command without waiting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResult {
    session_id: String,
    command_id: String,
    status: &'static str,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResult {
    command_id: String,
    cancelled: bool,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The cdbsh MCP server. Holds the [`DebugEngine`] that owns every session.
#[derive(Clone)]
pub struct CdbshServer {
    engine: Arc<DebugEngine>,
    tool_router: ToolRouter<CdbshServer>,
}

impl CdbshServer {
    /// Create a new server instance over an already-wired engine.
    #[must_use]
    pub fn new(engine: Arc<DebugEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

fn build_command_result(info: &CommandInfo, max_lines: usize) -> DebuggerCommandResult {
    let lines: Vec<String> = info.output.lines().map(str::to_string).collect();
    let windowed = output::window(&lines, max_lines);
    let session_id = info
        .command_id
        .strip_prefix("cmd-")
        .and_then(|rest| rest.rsplit_once('-'))
        .map(|(sid, _)| sid.to_string())
        .unwrap_or_default();
    DebuggerCommandResult {
        session_id,
        command_id: info.command_id.clone(),
        command: info.command.clone(),
        state: info.state,
        is_success: info.is_success,
        wait_time: info.wait_time,
        exec_time: info.exec_time,
        output_head: windowed.head,
        output_tail: windowed.tail,
        output_error_lines: windowed.error_lines,
        total_lines: windowed.total_lines,
        truncated: windowed.truncated,
        error_message: info.error_message.clone(),
        batch_command_id: info.batch_command_id.clone(),
    }
}

#[tool_router]
impl CdbshServer {
    #[tool(
        description = "Open a crash-dump analysis session: starts a dedicated cdb debugger process attached to the dump file. Returns the session_id used by every other tool. Set symbols_path to override the server's default symbol search path. Sessions are closed automatically after being idle, but close_dump_session promptly frees the debugger process."
    )]
    async fn open_dump_session(
        &self,
        Parameters(params): Parameters<OpenDumpSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(dump = %params.dump_path, "open_dump_session");
        match self
            .engine
            .create_session(&params.dump_path, params.symbols_path.as_deref())
            .await
        {
            Ok(session_id) => match self.engine.list_sessions().await {
                Ok(sessions) => {
                    let info = sessions.into_iter().find(|s| s.session_id == session_id);
                    json_content(&info)
                }
                Err(e) => err_result(e.to_string()),
            },
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Close a crash-dump analysis session and terminate its debugger process. Cancels any commands still queued or executing. Closing an unknown session is a no-op."
    )]
    async fn close_dump_session(
        &self,
        Parameters(params): Parameters<CloseDumpSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, "close_dump_session");
        match self.engine.close_session(&params.session_id).await {
            Ok(()) => json_content(&serde_json::json!({
                "sessionId": params.session_id,
                "closed": true,
            })),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "List all open analysis sessions with their dump path, state, debugger pid, and command counts."
    )]
    async fn list_dump_sessions(&self) -> Result<CallToolResult, McpError> {
        match self.engine.list_sessions().await {
            Ok(sessions) => json_content(&sessions),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Execute a debugger command in a session and block until it completes. Returns structured output with state, durations, and windowed output (head/tail/error_lines). Commands are queued FIFO per session; compatible short commands may be batched together transparently. For long-running commands (e.g. !analyze -v) consider start_debugger_command + wait_debugger_command so progress notifications are observable in between."
    )]
    async fn run_debugger_command(
        &self,
        Parameters(params): Parameters<RunDebuggerCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let max_lines = params.max_output_lines.unwrap_or(DEFAULT_MAX_OUTPUT_LINES);
        tracing::info!(session = %params.session_id, command = %params.command, "run_debugger_command");

        let command_id = match self
            .engine
            .enqueue_command(&params.session_id, &params.command)
            .await
        {
            Ok(id) => id,
            Err(e) => return err_result(e.to_string()),
        };

        match self
            .engine
            .get_command_info_async(&params.session_id, &command_id)
            .await
        {
            Ok(info) => {
                tracing::info!(
                    session = %params.session_id,
                    command = %command_id,
                    state = info.state.label(),
                    "run_debugger_command completed"
                );
                json_content(&build_command_result(&info, max_lines))
            }
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Enqueue a debugger command without waiting. Returns immediately with a command_id. Use wait_debugger_command to block until it completes, get_command_status to poll, or cancel_debugger_command to abort it."
    )]
    async fn start_debugger_command(
        &self,
        Parameters(params): Parameters<StartDebuggerCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, command = %params.command, "start_debugger_command");
        match self
            .engine
            .enqueue_command(&params.session_id, &params.command)
            .await
        {
            Ok(command_id) => json_content(&StartResult {
                session_id: params.session_id,
                command_id,
                status: "queued",
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Block until a previously started command reaches a terminal state and return its structured output. Returns immediately if already finished."
    )]
    async fn wait_debugger_command(
        &self,
        Parameters(params): Parameters<CommandRefParams>,
    ) -> Result<CallToolResult, McpError> {
        let max_lines = params.max_output_lines.unwrap_or(DEFAULT_MAX_OUTPUT_LINES);
        match self
            .engine
            .get_command_info_async(&params.session_id, &params.command_id)
            .await
        {
            Ok(info) => json_content(&build_command_result(&info, max_lines)),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Check a command's state without blocking: queued position, execution state, durations, and output collected so far (for terminal commands)."
    )]
    async fn get_command_status(
        &self,
        Parameters(params): Parameters<CommandRefParams>,
    ) -> Result<CallToolResult, McpError> {
        let max_lines = params.max_output_lines.unwrap_or(DEFAULT_MAX_OUTPUT_LINES);
        match self
            .engine
            .get_command_info(&params.session_id, &params.command_id)
            .await
        {
            Ok(info) => json_content(&build_command_result(&info, max_lines)),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "List every command issued on a session (queued, executing, and finished) with states and timings, in issue order."
    )]
    async fn list_session_commands(
        &self,
        Parameters(params): Parameters<SessionRefParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.engine.get_all_command_infos(&params.session_id).await {
            Ok(infos) => {
                let results: Vec<DebuggerCommandResult> = infos
                    .iter()
                    .map(|i| build_command_result(i, DEFAULT_MAX_OUTPUT_LINES))
                    .collect();
                json_content(&results)
            }
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Cancel a queued or executing command. A queued command is dropped immediately; an executing command is interrupted cooperatively and may end as cancelled or timedOut. Returns whether anything was cancelled."
    )]
    async fn cancel_debugger_command(
        &self,
        Parameters(params): Parameters<CommandRefParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, command = %params.command_id, "cancel_debugger_command");
        match self
            .engine
            .cancel_command(&params.session_id, &params.command_id)
            .await
        {
            Ok(cancelled) => json_content(&CancelResult {
                command_id: params.command_id,
                cancelled,
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Cancel every queued and executing command on a session. Returns the number of commands affected."
    )]
    async fn cancel_all_commands(
        &self,
        Parameters(params): Parameters<SessionRefParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, "cancel_all_commands");
        match self.engine.cancel_all_commands(&params.session_id).await {
            Ok(count) => json_content(&serde_json::json!({
                "sessionId": params.session_id,
                "cancelledCommands": count,
            })),
            Err(e) => err_result(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for CdbshServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "cdbsh".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "cdbsh drives the Windows crash-dump debugger (cdb) for post-mortem analysis.\n\n\
                 SESSIONS:\n\
                 Each session is a dedicated cdb process attached to one dump file. Use \
                 open_dump_session to start one, then run commands against its session_id. \
                 Sessions are isolated: a hung or crashed debugger is restarted automatically \
                 without affecting other sessions. Idle sessions are eventually closed.\n\n\
                 COMMANDS:\n\
                 run_debugger_command blocks until the command completes -- right for quick \
                 commands (lm, kL, r, dt). For long analyses (!analyze -v), use \
                 start_debugger_command + wait_debugger_command; the server emits \
                 commandStatus and commandHeartbeat notifications while work is in flight. \
                 Commands are executed strictly in order per session; short compatible \
                 commands may be merged into one debugger round-trip transparently, without \
                 changing per-command results.\n\n\
                 OUTPUT: Results carry windowed output (head + tail + error_lines) with \
                 total_lines. Raise max_output_lines on get_command_status to see more."
                    .to_string(),
            ),
        }
    }
}
