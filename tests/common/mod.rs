//! Shared test fixtures: fake capabilities and a scripted debugger child.
//!
//! The scripted child speaks the same `.echo` sentinel protocol a real cdb
//! does from the engine's point of view: it echoes `.echo` lines back and
//! "executes" anything else. A few magic command words drive failure modes:
//!
//! - `spin` -- produce nothing until interrupted, then resume (clean cancel)
//! - `hang` -- produce nothing and ignore interrupts (promoted cancel)
//! - `exit` -- terminate the child mid-command
//! - `emit N` -- produce N output lines (overflow tests)
//! - `rogue-sep` -- print a line equal to the batch separator sentinel
//!   (unbatch mismatch tests)
//!
//! Everything else responds with a single `executed: <command>` line.

#![allow(dead_code)]

use async_trait::async_trait;
use cdbsh::config::EngineConfig;
use cdbsh::notify::{McpNotification, NotificationBridge};
use cdbsh::sys::{
    Capabilities, ChildControl, Filesystem, ProcessManager, SpawnSpec, SpawnedChild, SystemClock,
};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

pub const DUMP: &str = "/dumps/ok.dmp";
pub const CDB: &str = "/tools/cdb.exe";

// ---------------------------------------------------------------------------
// Fake filesystem
// ---------------------------------------------------------------------------

pub struct FakeFs {
    files: Mutex<HashSet<PathBuf>>,
    unreadable: Mutex<HashSet<PathBuf>>,
}

impl FakeFs {
    pub fn new(files: &[&str]) -> Self {
        Self {
            files: Mutex::new(files.iter().map(PathBuf::from).collect()),
            unreadable: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, path: &str) {
        self.files.lock().unwrap().insert(PathBuf::from(path));
    }

    /// The file exists but opening it for read fails.
    pub fn mark_unreadable(&self, path: &str) {
        self.add(path);
        self.unreadable.lock().unwrap().insert(PathBuf::from(path));
    }
}

impl Filesystem for FakeFs {
    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn io::Read + Send>> {
        if self.unreadable.lock().unwrap().contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
        }
        if !self.exists(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        Ok(Box::new(io::Cursor::new(Vec::new())))
    }

    fn file_name(&self, path: &Path) -> Option<String> {
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|f| f.parent() == Some(path))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recording notification bridge
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBridge {
    frames: Mutex<Vec<McpNotification>>,
    /// When set, every send fails (for isolation tests).
    pub fail_sends: Mutex<bool>,
}

impl RecordingBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<McpNotification> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frames_for(&self, method: &str) -> Vec<McpNotification> {
        self.frames()
            .into_iter()
            .filter(|f| f.method == method)
            .collect()
    }

    /// Ordered status labels observed for one command id.
    pub fn statuses_for(&self, command_id: &str) -> Vec<String> {
        self.frames_for("notifications/commandStatus")
            .iter()
            .filter(|f| f.params["commandId"] == command_id)
            .map(|f| f.params["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl NotificationBridge for RecordingBridge {
    async fn send(&self, notification: McpNotification) -> Result<(), String> {
        if *self.fail_sends.lock().unwrap() {
            return Err("bridge down".to_string());
        }
        self.frames.lock().unwrap().push(notification);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted debugger child
// ---------------------------------------------------------------------------

/// Per-spawn behavior of the scripted debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildBehavior {
    /// Speak the protocol normally.
    Normal,
    /// Consume stdin but never produce output (startup probe times out).
    Silent,
    /// Refuse to spawn at all.
    SpawnError,
}

struct FakeControl {
    exit_rx: watch::Receiver<Option<i32>>,
    kill: CancellationToken,
    interrupted: Arc<Notify>,
}

#[async_trait]
impl ChildControl for FakeControl {
    fn interrupt(&self) -> io::Result<()> {
        self.interrupted.notify_one();
        Ok(())
    }

    fn kill(&self) {
        self.kill.cancel();
    }

    async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().unwrap_or(-1);
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }
}

/// Process manager whose children are in-process scripted tasks.
pub struct ScriptedProcessManager {
    behaviors: Mutex<VecDeque<ChildBehavior>>,
    pub spawn_count: AtomicUsize,
    pub last_spec: Mutex<Option<SpawnSpec>>,
}

impl ScriptedProcessManager {
    /// Every spawn behaves normally.
    pub fn normal() -> Arc<Self> {
        Self::with_behaviors(&[])
    }

    /// The first spawns take the queued behaviors in order; later spawns are
    /// normal.
    pub fn with_behaviors(behaviors: &[ChildBehavior]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.iter().copied().collect()),
            spawn_count: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessManager for ScriptedProcessManager {
    async fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedChild> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ChildBehavior::Normal);

        if behavior == ChildBehavior::SpawnError {
            return Err(io::Error::new(io::ErrorKind::NotFound, "spawn refused"));
        }

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap() = Some(spec.clone());

        let (stdin_srv, stdin_child) = tokio::io::duplex(256 * 1024);
        let (stdout_child, stdout_srv) = tokio::io::duplex(256 * 1024);
        let (_stderr_child, stderr_srv) = tokio::io::duplex(1024);

        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let kill = CancellationToken::new();
        let interrupted = Arc::new(Notify::new());

        tokio::spawn(run_child(
            behavior,
            stdin_child,
            stdout_child,
            exit_tx,
            kill.clone(),
            interrupted.clone(),
        ));

        Ok(SpawnedChild {
            pid: Some(4242),
            stdin: Box::new(stdin_srv),
            stdout: Box::new(stdout_srv),
            stderr: Box::new(stderr_srv),
            control: Arc::new(FakeControl {
                exit_rx,
                kill,
                interrupted,
            }),
        })
    }
}

async fn run_child(
    behavior: ChildBehavior,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    exit_tx: watch::Sender<Option<i32>>,
    kill: CancellationToken,
    interrupted: Arc<Notify>,
) {
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = tokio::select! {
            () = kill.cancelled() => {
                let _ = exit_tx.send(Some(-1));
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            // stdin closed: the server is done with us.
            _ => {
                let _ = exit_tx.send(Some(0));
                return;
            }
        };
        let line = line.trim().to_string();

        if behavior == ChildBehavior::Silent {
            continue;
        }

        if let Some(msg) = line.strip_prefix(".echo ") {
            if write_line(&mut stdout, msg).await.is_err() {
                let _ = exit_tx.send(Some(-1));
                return;
            }
            continue;
        }

        match line.as_str() {
            "" => {}
            "q" => {
                let _ = exit_tx.send(Some(0));
                return;
            }
            "exit" => {
                let _ = exit_tx.send(Some(1));
                return;
            }
            "spin" => {
                tokio::select! {
                    () = interrupted.notified() => {} // resume the read loop
                    () = kill.cancelled() => {
                        let _ = exit_tx.send(Some(-1));
                        return;
                    }
                }
            }
            "hang" => {
                // Deaf to interrupts; only a kill ends this.
                kill.cancelled().await;
                let _ = exit_tx.send(Some(-1));
                return;
            }
            "rogue-sep" => {
                if write_line(&mut stdout, "__CDBSH_COMMAND_SEPARATOR__")
                    .await
                    .is_err()
                {
                    let _ = exit_tx.send(Some(-1));
                    return;
                }
            }
            other => {
                if let Some(n) = other.strip_prefix("emit ").and_then(|n| n.parse::<usize>().ok())
                {
                    for i in 0..n {
                        if write_line(&mut stdout, &format!("output line {i}")).await.is_err() {
                            let _ = exit_tx.send(Some(-1));
                            return;
                        }
                    }
                } else if write_line(&mut stdout, &format!("executed: {other}"))
                    .await
                    .is_err()
                {
                    let _ = exit_tx.send(Some(-1));
                    return;
                }
            }
        }
    }
}

async fn write_line(out: &mut DuplexStream, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

// ---------------------------------------------------------------------------
// Config / wiring helpers
// ---------------------------------------------------------------------------

/// Engine config with short, test-friendly durations. Control commands used
/// by the scripted child are excluded from batching so tests that need
/// single dispatches stay deterministic.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        cdb_path: Some(PathBuf::from(CDB)),
        max_sessions: 8,
        session_idle_timeout: Duration::from_secs(300),
        idle_sweep_interval: Duration::from_secs(300),
        startup_timeout: Duration::from_millis(800),
        command_timeout: Duration::from_millis(1500),
        heartbeat_interval: Duration::from_secs(60),
        interrupt_grace: Duration::from_millis(300),
        stop_grace: Duration::from_millis(300),
        batch_exclusions: vec![
            "!analyze".to_string(),
            ".restart".to_string(),
            "q".to_string(),
            "spin".to_string(),
            "hang".to_string(),
            "exit".to_string(),
            "emit".to_string(),
        ],
        ..EngineConfig::default()
    }
}

pub fn test_fs() -> Arc<FakeFs> {
    Arc::new(FakeFs::new(&[DUMP, CDB]))
}

pub fn caps_with(fs: Arc<FakeFs>, proc: Arc<ScriptedProcessManager>) -> Capabilities {
    Capabilities {
        fs,
        proc,
        clock: Arc::new(SystemClock),
    }
}

/// Wire a full engine over the fakes.
pub fn engine_with(
    config: EngineConfig,
    proc: Arc<ScriptedProcessManager>,
) -> (
    Arc<cdbsh::DebugEngine>,
    Arc<RecordingBridge>,
    Arc<FakeFs>,
) {
    let fs = test_fs();
    let bridge = RecordingBridge::new();
    let engine = cdbsh::DebugEngine::new(config, caps_with(fs.clone(), proc), bridge.clone());
    (engine, bridge, fs)
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
