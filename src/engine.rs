//! The debug engine façade: argument validation, session/command API, and
//! engine events.
//!
//! Constructed once at startup and passed explicitly to the transport layer;
//! there is no ambient global instance. Every public operation validates its
//! arguments before dispatch, rejects unknown sessions, and refuses to run
//! after [`shutdown`].
//!
//! [`shutdown`]: DebugEngine::shutdown

use crate::command::{CommandInfo, CommandState};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notify::{NotificationBridge, NotificationHub};
use crate::queue::CancelReason;
use crate::session::{Session, SessionInfo, SessionManager, SessionState};
use crate::sys::Capabilities;
use crate::timeout::TimeoutService;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// State-change events exposed to in-process subscribers (the tool layer and
/// tests). Notifications to remote clients go through the hub instead.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CommandStateChanged {
        session_id: String,
        command_id: String,
        state: CommandState,
    },
    SessionStateChanged {
        session_id: String,
        state: SessionState,
    },
}

/// The engine: one per process.
pub struct DebugEngine {
    config: Arc<EngineConfig>,
    caps: Capabilities,
    manager: Arc<SessionManager>,
    timeouts: Arc<TimeoutService>,
    events: broadcast::Sender<EngineEvent>,
    closed: AtomicBool,
}

impl DebugEngine {
    /// Wire the engine: one timeout service, one notification hub, one
    /// session manager.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        caps: Capabilities,
        bridge: Arc<dyn NotificationBridge>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let hub = Arc::new(NotificationHub::new(bridge));
        let timeouts = TimeoutService::start(caps.clock.clone());
        let (events, _) = broadcast::channel(256);

        let manager = SessionManager::new(
            config.clone(),
            caps.clone(),
            hub,
            timeouts.clone(),
            events.clone(),
        );
        manager.start_sweeper();

        Arc::new(Self {
            config,
            caps,
            manager,
            timeouts,
            events,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to command/session state-change events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::EngineClosed);
        }
        Ok(())
    }

    fn require(name: &str, value: &str) -> EngineResult<()> {
        if value.trim().is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "{name} must not be empty"
            )));
        }
        Ok(())
    }

    async fn session(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        self.manager
            .get(session_id)
            .await
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    /// Touch a session's activity clock. Any enqueue, result read, or status
    /// query counts as activity for idle eviction.
    fn touch(&self, session: &Session) {
        session.touch(self.caps.clock.now());
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn create_session(
        &self,
        dump_path: &str,
        symbols_path: Option<&str>,
    ) -> EngineResult<String> {
        self.ensure_open()?;
        Self::require("dump_path", dump_path)?;
        self.manager.create(dump_path, symbols_path).await
    }

    /// Close a session. Closing an unknown session succeeds as a no-op.
    pub async fn close_session(&self, session_id: &str) -> EngineResult<()> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        self.manager.close(session_id).await
    }

    pub async fn is_session_active(&self, session_id: &str) -> EngineResult<bool> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        Ok(self.manager.exists(session_id).await)
    }

    pub async fn list_sessions(&self) -> EngineResult<Vec<SessionInfo>> {
        self.ensure_open()?;
        Ok(self.manager.list().await)
    }

    pub async fn get_session_state(&self, session_id: &str) -> EngineResult<SessionState> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        Ok(session.state())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn enqueue_command(&self, session_id: &str, text: &str) -> EngineResult<String> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        Self::require("command", text)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        session.queue.enqueue(text).await
    }

    /// Await a command's terminal state and return its final snapshot.
    pub async fn get_command_info_async(
        &self,
        session_id: &str,
        command_id: &str,
    ) -> EngineResult<CommandInfo> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        Self::require("command_id", command_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        session.queue.wait_result(command_id).await
    }

    /// Non-blocking snapshot of one command.
    pub async fn get_command_info(
        &self,
        session_id: &str,
        command_id: &str,
    ) -> EngineResult<CommandInfo> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        Self::require("command_id", command_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        session.queue.get_info(command_id)
    }

    /// Non-blocking snapshot of every command on a session, in issue order.
    pub async fn get_all_command_infos(&self, session_id: &str) -> EngineResult<Vec<CommandInfo>> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        Ok(session.queue.list_infos())
    }

    /// Cancel one command; returns whether a transition was effected.
    pub async fn cancel_command(&self, session_id: &str, command_id: &str) -> EngineResult<bool> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        Self::require("command_id", command_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        session.queue.cancel(command_id, CancelReason::User).await
    }

    /// Cancel every non-terminal command; returns how many were affected.
    pub async fn cancel_all_commands(&self, session_id: &str) -> EngineResult<usize> {
        self.ensure_open()?;
        Self::require("session_id", session_id)?;
        let session = self.session(session_id).await?;
        self.touch(&session);
        Ok(session.queue.cancel_all(CancelReason::User).await)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Close every session and stop the shared services. Idempotent; all
    /// API calls fail with `EngineClosed` afterwards.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutting down");
        self.manager.shutdown().await;
        self.timeouts.shutdown();
    }
}
