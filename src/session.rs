//! Analysis sessions: one crash dump, one live debugger process, one queue.
//!
//! The manager owns the `session_id -> Session` map and enforces the global
//! policies: capacity on create, dump validation, idle eviction, graceful
//! close. Sessions own their process and queue exclusively; everything else
//! refers to them by id.

use crate::batch::BatchProcessor;
use crate::command::CommandState;
use crate::config::EngineConfig;
use crate::engine::EngineEvent;
use crate::error::{EngineError, EngineResult};
use crate::locator::{self, OsArch};
use crate::notify::{NotificationHub, ServerHealthParams};
use crate::process::ProcessSession;
use crate::queue::CommandQueue;
use crate::recovery;
use crate::sys::{Capabilities, SpawnSpec};
use crate::timeout::TimeoutService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The debugger executable sessions are driven through.
const DEBUGGER_TOOL: &str = "cdb.exe";

/// Lifecycle state of a session. Transitions are monotonic toward
/// `Closed`/`Failed`: once closing begins there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Recovering,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// States a session can never leave (except `Closing -> Closed`).
    fn rank(self) -> u8 {
        match self {
            Self::Initializing | Self::Ready | Self::Busy | Self::Recovering => 0,
            Self::Closing => 1,
            Self::Closed | Self::Failed => 2,
        }
    }
}

/// One analysis session.
pub struct Session {
    pub id: String,
    pub dump_path: PathBuf,
    pub symbols_path: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub process: Arc<ProcessSession>,
    pub queue: Arc<CommandQueue>,
    /// Fired when the session begins closing; observed by the supervisor.
    pub closing: CancellationToken,
    state: Mutex<SessionState>,
    last_activity: Mutex<DateTime<Utc>>,
    events: broadcast::Sender<EngineEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Current state. `Busy` is reported while the stored state is `Ready`
    /// and a command is on the wire.
    pub fn state(&self) -> SessionState {
        let stored = *self.state.lock().expect("session state poisoned");
        if stored == SessionState::Ready
            && self.process.status() == crate::process::ProcessStatus::Executing
        {
            SessionState::Busy
        } else {
            stored
        }
    }

    /// Apply a state transition, refusing any that would resurrect a closing
    /// or closed session. Returns whether the transition took effect.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().expect("session state poisoned");
        let current = *state;
        let allowed = match (current, next) {
            _ if current == next => false,
            (SessionState::Closing, SessionState::Closed) => true,
            _ => next.rank() >= current.rank() && current.rank() == 0,
        };
        if allowed {
            *state = next;
            drop(state);
            let _ = self.events.send(EngineEvent::SessionStateChanged {
                session_id: self.id.clone(),
                state: next,
            });
        }
        allowed
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_activity.lock().expect("activity lock poisoned") = now;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    /// Snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            dump_path: self.dump_path.display().to_string(),
            symbols_path: self.symbols_path.clone(),
            state: self.state(),
            opened_at: self.opened_at,
            last_activity: self.last_activity(),
            pid: self.process.pid(),
            queued_commands: self.queue.queued_count(),
            active_commands: self.queue.active_count(),
        }
    }
}

/// Serializable session summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub dump_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols_path: Option<String>,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub queued_commands: usize,
    pub active_commands: usize,
}

/// Owns every session in the process.
pub struct SessionManager {
    config: Arc<EngineConfig>,
    caps: Capabilities,
    hub: Arc<NotificationHub>,
    timeouts: Arc<TimeoutService>,
    batcher: Arc<BatchProcessor>,
    events: broadcast::Sender<EngineEvent>,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
    started: tokio::time::Instant,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        caps: Capabilities,
        hub: Arc<NotificationHub>,
        timeouts: Arc<TimeoutService>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            batcher: Arc::new(BatchProcessor::new(config.clone())),
            config,
            caps,
            hub,
            timeouts,
            events,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            started: tokio::time::Instant::now(),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Spawn the periodic idle sweep / health snapshot task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    () = manager.caps.clock.after(manager.config.idle_sweep_interval) => {}
                }
                manager.sweep_idle().await;
                manager.publish_health().await;
            }
        });
        *self.sweeper.lock().expect("sweeper slot poisoned") = Some(handle);
    }

    /// Create a session for a dump file and start its debugger.
    pub async fn create(
        &self,
        dump_path: &str,
        symbols_path: Option<&str>,
    ) -> EngineResult<String> {
        let dump = PathBuf::from(dump_path);
        if !self.caps.fs.exists(&dump) {
            return Err(EngineError::DumpNotFound(dump));
        }
        if let Err(e) = self.caps.fs.open_read(&dump) {
            return Err(EngineError::DumpUnreadable {
                path: dump,
                reason: e.to_string(),
            });
        }

        {
            let sessions = self.sessions.lock().await;
            let active = sessions.values().filter(|s| s.state().rank() == 0).count();
            if active >= self.config.max_sessions {
                return Err(EngineError::AtCapacity {
                    active,
                    max: self.config.max_sessions,
                });
            }
        }

        let cdb = locator::find_tool_path(
            self.caps.fs.as_ref(),
            DEBUGGER_TOOL,
            self.config.cdb_path.as_deref(),
            OsArch::host(),
            &self.config.install_roots,
        )?;

        let symbols = symbols_path
            .map(str::to_string)
            .or_else(|| self.config.symbols_path.clone());

        let mut args = vec!["-z".to_string(), dump.display().to_string()];
        if let Some(sym) = &symbols {
            args.push("-y".to_string());
            args.push(sym.clone());
        }
        args.push("-lines".to_string());

        let session_id = format!(
            "sess-{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let spec = SpawnSpec {
            program: cdb,
            args,
            cwd: None,
            env: Vec::new(),
        };

        let process = Arc::new(ProcessSession::new(
            session_id.clone(),
            spec,
            self.config.clone(),
            self.caps.proc.clone(),
        ));

        tracing::info!(session = %session_id, dump = %dump.display(), "creating session");
        process.start().await?;

        let queue = CommandQueue::new(
            session_id.clone(),
            self.config.clone(),
            self.caps.clock.clone(),
            process.clone(),
            self.batcher.clone(),
            self.hub.clone(),
            self.timeouts.clone(),
            self.events.clone(),
        );
        queue.start();

        let now = self.caps.clock.now();
        let session = Arc::new(Session {
            id: session_id.clone(),
            dump_path: dump,
            symbols_path: symbols,
            opened_at: now,
            process,
            queue,
            closing: CancellationToken::new(),
            state: Mutex::new(SessionState::Initializing),
            last_activity: Mutex::new(now),
            events: self.events.clone(),
            supervisor: Mutex::new(None),
        });
        session.set_state(SessionState::Ready);

        let supervisor = recovery::spawn_supervisor(
            session.clone(),
            self.config.clone(),
            self.hub.clone(),
            self.caps.clock.clone(),
        );
        *session.supervisor.lock().expect("supervisor slot poisoned") = Some(supervisor);

        // Re-check capacity at insert time: a concurrent create may have
        // taken the slot while this debugger was starting up.
        {
            let mut sessions = self.sessions.lock().await;
            let active = sessions.values().filter(|s| s.state().rank() == 0).count();
            if active >= self.config.max_sessions {
                drop(sessions);
                self.dismantle(&session).await;
                return Err(EngineError::AtCapacity {
                    active,
                    max: self.config.max_sessions,
                });
            }
            sessions.insert(session_id.clone(), session);
        }

        self.hub.resources_list_changed().await;
        tracing::info!(session = %session_id, "session ready");
        Ok(session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        infos
    }

    /// Close a session: cancel its commands, stop its debugger, remove it.
    /// Closing an unknown session is a no-op.
    pub async fn close(&self, session_id: &str) -> EngineResult<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        let Some(session) = session else {
            return Ok(());
        };

        tracing::info!(session = %session_id, "closing session");
        self.dismantle(&session).await;
        self.hub.resources_list_changed().await;
        Ok(())
    }

    /// Wind a session down: stop its workers and debugger, join the
    /// supervisor, and mark it closed.
    async fn dismantle(&self, session: &Arc<Session>) {
        session.set_state(SessionState::Closing);
        session.closing.cancel();

        session.queue.shutdown().await;
        session.process.stop().await;

        let supervisor = session
            .supervisor
            .lock()
            .expect("supervisor slot poisoned")
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        session.set_state(SessionState::Closed);
    }

    /// Close sessions idle past the configured timeout that have no
    /// non-terminal commands. A stuck executing command never qualifies --
    /// reclaiming those is the recovery supervisor's job.
    async fn sweep_idle(&self) {
        let now = self.caps.clock.now();
        let cutoff = chrono::Duration::from_std(self.config.session_idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));

        let idle: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| {
                    s.state() == SessionState::Ready
                        && s.queue.active_count() == 0
                        && now - s.last_activity() > cutoff
                })
                .map(|s| s.id.clone())
                .collect()
        };

        for id in idle {
            tracing::info!(session = %id, "closing idle session");
            let _ = self.close(&id).await;
        }
    }

    async fn publish_health(&self) {
        let (any_alive, queued, executing) = {
            let sessions = self.sessions.lock().await;
            let any_alive = sessions.values().any(|s| s.process.is_alive());
            let queued: usize = sessions.values().map(|s| s.queue.queued_count()).sum();
            let executing: usize = sessions
                .values()
                .flat_map(|s| s.queue.list_infos())
                .filter(|c| c.state == CommandState::Executing)
                .count();
            (any_alive, queued, executing)
        };

        self.hub
            .server_health(ServerHealthParams {
                status: "ok",
                cdb_session_active: any_alive,
                queue_size: queued,
                active_commands: executing,
                uptime: Some(self.started.elapsed().as_secs_f64()),
                timestamp: self.caps.clock.now(),
            })
            .await;
    }

    /// Close every session and stop the sweeper.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().expect("sweeper slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.close(&id).await;
        }
    }
}
