//! Injected system capabilities: filesystem, clock, and process management.
//!
//! The engine never touches `std::fs`, `tokio::process`, or the wall clock
//! directly; it goes through the traits here so tests can substitute an
//! in-memory filesystem and a scripted child process. Production
//! implementations live alongside the traits and are wired once in `main`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

/// Filesystem access used for dump validation and tool location.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    /// Open a file for reading. Used to verify a dump is actually readable.
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn file_name(&self, path: &Path) -> Option<String>;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem.
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn file_name(&self, path: &Path) -> Option<String> {
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}

/// Wall clock and timer capability. `after` resolves through the tokio timer
/// so paused-time tests drive it deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// What to spawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A spawned child with redirected UTF-8 stdio and a control handle.
pub struct SpawnedChild {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Arc<dyn ChildControl>,
}

/// Control surface over a spawned child, independent of its stdio.
#[async_trait]
pub trait ChildControl: Send + Sync {
    /// Best-effort Ctrl-Break-equivalent: abort the command the child is
    /// currently running without terminating the child itself.
    fn interrupt(&self) -> io::Result<()>;
    /// Forcibly terminate the child.
    fn kill(&self);
    /// Wait for the child to exit; returns the exit code, or -1 if unknown.
    async fn wait(&self) -> i32;
    /// True while the child has not exited.
    fn is_alive(&self) -> bool;
}

/// Process spawning capability.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedChild>;
}

/// Real process manager over `tokio::process`.
///
/// Children are placed in their own process group so an interrupt reaches the
/// debugger without touching this server: `CREATE_NEW_PROCESS_GROUP` +
/// `GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT)` on Windows, `setsid` + SIGINT
/// to the group elsewhere. No console window is created on Windows.
pub struct TokioProcessManager;

#[async_trait]
impl ProcessManager for TokioProcessManager {
    async fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedChild> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP
            cmd.creation_flags(0x0800_0000 | 0x0000_0200);
        }

        #[cfg(unix)]
        {
            // New session so SIGINT to the group reaches only the child tree.
            // SAFETY: pre_exec runs before exec in the child process.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(io::Error::other)?;
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not piped"))?;

        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        // Reaper task: owns the child handle, publishes the exit code, and
        // applies kill requests.
        tokio::spawn(async move {
            let mut kill_open = true;
            loop {
                if !kill_open {
                    let code = match child.wait().await {
                        Ok(s) => s.code().unwrap_or(-1),
                        Err(_) => -1,
                    };
                    let _ = exit_tx.send(Some(code));
                    break;
                }
                tokio::select! {
                    status = child.wait() => {
                        let code = match status {
                            Ok(s) => s.code().unwrap_or(-1),
                            Err(_) => -1,
                        };
                        let _ = exit_tx.send(Some(code));
                        break;
                    }
                    msg = kill_rx.recv() => {
                        match msg {
                            Some(()) => {
                                let _ = child.start_kill();
                            }
                            None => kill_open = false,
                        }
                    }
                }
            }
        });

        Ok(SpawnedChild {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Arc::new(TokioChildControl {
                pid,
                exit_rx,
                kill_tx,
            }),
        })
    }
}

struct TokioChildControl {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl ChildControl for TokioChildControl {
    fn interrupt(&self) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::other("process has no pid (already exited?)"))?;
        send_break(pid)
    }

    fn kill(&self) {
        let _ = self.kill_tx.send(());
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

#[cfg(windows)]
fn send_break(pid: u32) -> io::Result<()> {
    use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
    // Reaches the child's process group; the debugger treats Ctrl-Break as
    // "abort the current command, keep the session".
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) }
        .map_err(|e| io::Error::other(format!("GenerateConsoleCtrlEvent failed: {e}")))
}

#[cfg(unix)]
fn send_break(pid: u32) -> io::Result<()> {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-(pid as i32)),
        nix::sys::signal::Signal::SIGINT,
    )
    .map_err(io::Error::other)
}

/// The capability bundle handed to the engine at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub fs: Arc<dyn Filesystem>,
    pub proc: Arc<dyn ProcessManager>,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    /// Production wiring: real filesystem, real processes, real clock.
    pub fn system() -> Self {
        Self {
            fs: Arc::new(StdFilesystem),
            proc: Arc::new(TokioProcessManager),
            clock: Arc::new(SystemClock),
        }
    }
}
