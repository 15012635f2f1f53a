//! One cdb child process: spawning, stream pumps, and sentinel-framed
//! command execution.
//!
//! cdb has no reliable end-of-output marker, so every command is bracketed by
//! `.echo` sentinel lines written to the child's stdin. The stdout pump
//! accumulates lines only between the observed Start and End echoes; anything
//! outside the window is discarded. Commands run strictly one at a time per
//! process, guarded by an execution mutex. Cancellation is cooperative: a
//! Ctrl-Break-equivalent interrupt first, and if the End echo still does not
//! arrive within the grace window the process is declared hung for the
//! recovery supervisor to restart.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::output;
use crate::sys::{ChildControl, ProcessManager, SpawnSpec};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Echoed before a command's output.
pub const START_MARKER: &str = "__CDBSH_COMMAND_START__";
/// Echoed after a command's output.
pub const END_MARKER: &str = "__CDBSH_COMMAND_END__";
/// Echoed between merged commands inside a batch.
pub const COMMAND_SEPARATOR: &str = "__CDBSH_COMMAND_SEPARATOR__";
/// Echoed once at startup to detect readiness.
const READY_MARKER: &str = "__CDBSH_READY__";
/// Common prefix of all sentinels; used to filter echoed input lines.
const MARKER_PREFIX: &str = "__CDBSH_";

/// Lifecycle status of the child debugger process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    Starting,
    Idle,
    Executing,
    Hung,
    Exited,
}

/// Why the process left its healthy state. Consumed (once) by the recovery
/// supervisor to label the recovery notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    CommandTimedOut,
    CancelUnresponsive,
    ProcessExited,
}

impl FaultReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandTimedOut => "CommandTimedOut",
            Self::CancelUnresponsive => "CancelUnresponsive",
            Self::ProcessExited => "ProcessExited",
        }
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecVerdict {
    /// End echo observed.
    Completed,
    /// End echo observed but the output cap was exceeded along the way.
    Overflow,
    /// Cancelled and the interrupt landed: End echo arrived within grace.
    InterruptedClean,
    /// Cancelled but the child never produced the End echo. The caller must
    /// mark the process hung so the supervisor restarts it.
    InterruptedHung,
    /// The child exited mid-command.
    ChildExited,
}

/// Output and verdict of one execution.
#[derive(Debug)]
pub struct ExecOutcome {
    pub output: String,
    pub verdict: ExecVerdict,
}

enum PumpEvent {
    Stdout(String),
    Stderr(String),
    Eof,
}

struct ChildIo {
    stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    events: mpsc::UnboundedReceiver<PumpEvent>,
    control: Arc<dyn ChildControl>,
    pumps: Vec<JoinHandle<()>>,
}

/// Owns one cdb child over the life of a session. A restart replaces the
/// child but keeps this object (and the session id) intact.
pub struct ProcessSession {
    session_id: String,
    spec: SpawnSpec,
    config: Arc<EngineConfig>,
    procman: Arc<dyn ProcessManager>,
    /// Serializes executions: at most one in-flight command per process.
    exec_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<ProcessStatus>,
    io: tokio::sync::Mutex<Option<ChildIo>>,
    /// Control handle kept outside `io` so interrupt/liveness never contend
    /// with an in-flight execution.
    control: Mutex<Option<Arc<dyn ChildControl>>>,
    pid: Mutex<Option<u32>>,
    fault: Mutex<Option<FaultReason>>,
}

impl ProcessSession {
    #[must_use]
    pub fn new(
        session_id: String,
        spec: SpawnSpec,
        config: Arc<EngineConfig>,
        procman: Arc<dyn ProcessManager>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ProcessStatus::Starting);
        Self {
            session_id,
            spec,
            config,
            procman,
            exec_lock: tokio::sync::Mutex::new(()),
            status_tx,
            io: tokio::sync::Mutex::new(None),
            control: Mutex::new(None),
            pid: Mutex::new(None),
            fault: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status transitions (used by the recovery supervisor and
    /// the queue worker's idle wait).
    pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().expect("pid lock poisoned")
    }

    pub fn is_alive(&self) -> bool {
        self.control
            .lock()
            .expect("control lock poisoned")
            .as_ref()
            .is_some_and(|c| c.is_alive())
    }

    fn set_status(&self, status: ProcessStatus) {
        self.status_tx.send_replace(status);
    }

    /// Record why the process is about to be (or was) lost, then flip the
    /// status so the supervisor wakes. Idempotent per fault: the first reason
    /// recorded wins.
    pub fn mark_hung(&self, reason: FaultReason) {
        self.fault
            .lock()
            .expect("fault lock poisoned")
            .get_or_insert(reason);
        self.set_status(ProcessStatus::Hung);
    }

    /// Take the pending fault reason, if any.
    pub fn take_fault(&self) -> Option<FaultReason> {
        self.fault.lock().expect("fault lock poisoned").take()
    }

    /// Spawn the child and wait for the readiness echo.
    pub async fn start(&self) -> EngineResult<()> {
        let mut slot = self.io.lock().await;
        if slot.is_some() {
            return Err(EngineError::StartupFailed(
                "process already started".to_string(),
            ));
        }
        *slot = Some(self.spawn_and_probe().await?);
        Ok(())
    }

    /// Kill the current child (if any) and start a fresh one. Pending pump
    /// tasks and accumulated events are discarded with the old child.
    pub async fn restart(&self) -> EngineResult<()> {
        let mut slot = self.io.lock().await;
        if let Some(old) = slot.take() {
            self.teardown(old).await;
        }
        *slot = Some(self.spawn_and_probe().await?);
        Ok(())
    }

    /// Graceful stop: `q` to the debugger, bounded wait, then kill.
    pub async fn stop(&self) {
        let mut slot = self.io.lock().await;
        if let Some(mut io) = slot.take() {
            let _ = io.stdin.write_all(b"q\n").await;
            let _ = io.stdin.flush().await;
            let control = io.control.clone();
            if tokio::time::timeout(self.config.stop_grace, control.wait())
                .await
                .is_err()
            {
                tracing::debug!(session = %self.session_id, "debugger ignored quit, killing");
            }
            self.teardown(io).await;
        }
        self.set_status(ProcessStatus::Exited);
    }

    async fn teardown(&self, io: ChildIo) {
        io.control.kill();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), io.control.wait()).await;
        for pump in io.pumps {
            pump.abort();
        }
        *self.control.lock().expect("control lock poisoned") = None;
        *self.pid.lock().expect("pid lock poisoned") = None;
    }

    async fn spawn_and_probe(&self) -> EngineResult<ChildIo> {
        self.set_status(ProcessStatus::Starting);
        *self.fault.lock().expect("fault lock poisoned") = None;

        let child = self
            .procman
            .spawn(&self.spec)
            .await
            .map_err(|e| EngineError::StartupFailed(format!("spawn failed: {e}")))?;

        tracing::info!(
            session = %self.session_id,
            pid = child.pid,
            program = %self.spec.program.display(),
            "debugger process spawned"
        );

        let (tx, events) = mpsc::unbounded_channel();

        let stdout_tx = tx.clone();
        let stdout_pump = tokio::spawn(async move {
            let mut lines = BufReader::new(child.stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(PumpEvent::Stdout(line)).is_err() {
                    return;
                }
            }
            let _ = stdout_tx.send(PumpEvent::Eof);
        });

        let stderr_tx = tx;
        let stderr_pump = tokio::spawn(async move {
            let mut lines = BufReader::new(child.stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(PumpEvent::Stderr(line)).is_err() {
                    return;
                }
            }
        });

        *self.control.lock().expect("control lock poisoned") = Some(child.control.clone());
        *self.pid.lock().expect("pid lock poisoned") = child.pid;

        let mut io = ChildIo {
            stdin: child.stdin,
            events,
            control: child.control,
            pumps: vec![stdout_pump, stderr_pump],
        };

        // Readiness probe: cdb replays queued input once initialization is
        // done, so the echo arriving means the debugger accepts commands.
        if let Err(e) = write_line(&mut io.stdin, &format!(".echo {READY_MARKER}")).await {
            self.teardown(io).await;
            self.set_status(ProcessStatus::Exited);
            return Err(EngineError::StartupFailed(format!(
                "failed to write readiness probe: {e}"
            )));
        }

        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, io.events.recv()).await;
            match event {
                Ok(Some(PumpEvent::Stdout(line))) => {
                    if output::clean_line(&line) == READY_MARKER {
                        break;
                    }
                }
                Ok(Some(PumpEvent::Stderr(_))) => {}
                Ok(Some(PumpEvent::Eof)) | Ok(None) => {
                    self.teardown(io).await;
                    self.set_status(ProcessStatus::Exited);
                    return Err(EngineError::StartupFailed(
                        "debugger exited during startup".to_string(),
                    ));
                }
                Err(_) => {
                    self.teardown(io).await;
                    self.set_status(ProcessStatus::Exited);
                    return Err(EngineError::StartupFailed(format!(
                        "no debugger output within {:?}",
                        self.config.startup_timeout
                    )));
                }
            }
        }

        self.set_status(ProcessStatus::Idle);
        tracing::info!(session = %self.session_id, "debugger ready");
        Ok(io)
    }

    /// Best-effort Ctrl-Break-equivalent to abort the in-flight command
    /// without terminating the child.
    pub fn interrupt(&self) -> std::io::Result<()> {
        match self
            .control
            .lock()
            .expect("control lock poisoned")
            .as_ref()
        {
            Some(control) => control.interrupt(),
            None => Err(std::io::Error::other("no child process")),
        }
    }

    /// Execute one sentinel-framed command to completion, cancellation, or
    /// child death. The caller owns the deadline: it fires `cancel` when the
    /// command's time is up.
    ///
    /// On [`ExecVerdict::InterruptedHung`] the process status is still
    /// `Executing`; the caller decides the fault reason via [`mark_hung`].
    ///
    /// [`mark_hung`]: ProcessSession::mark_hung
    pub async fn execute_one(&self, command_text: &str, cancel: &CancellationToken) -> ExecOutcome {
        let _guard = self.exec_lock.lock().await;
        let mut slot = self.io.lock().await;

        let Some(io) = slot.as_mut() else {
            return ExecOutcome {
                output: String::new(),
                verdict: ExecVerdict::ChildExited,
            };
        };
        if self.status() != ProcessStatus::Idle {
            return ExecOutcome {
                output: String::new(),
                verdict: ExecVerdict::ChildExited,
            };
        }

        self.set_status(ProcessStatus::Executing);

        let framed = format!(".echo {START_MARKER}\n{command_text}\n.echo {END_MARKER}");
        if let Err(e) = write_line(&mut io.stdin, &framed).await {
            tracing::warn!(session = %self.session_id, error = %e, "stdin write failed");
            self.set_status(ProcessStatus::Exited);
            return ExecOutcome {
                output: String::new(),
                verdict: ExecVerdict::ChildExited,
            };
        }

        let mut acc = Accumulator::new(self.config.max_output_bytes);
        let mut in_window = false;

        loop {
            tokio::select! {
                event = io.events.recv() => match event {
                    Some(PumpEvent::Stdout(line)) => {
                        let clean = output::clean_line(&line);
                        if !in_window {
                            if clean == START_MARKER {
                                in_window = true;
                            }
                            continue;
                        }
                        if clean == END_MARKER {
                            self.set_status(ProcessStatus::Idle);
                            return ExecOutcome {
                                output: acc.text(),
                                verdict: if acc.overflowed {
                                    ExecVerdict::Overflow
                                } else {
                                    ExecVerdict::Completed
                                },
                            };
                        }
                        // Our own injected meta-commands echoed back by the
                        // debugger are not command output.
                        if clean.starts_with(".echo ") && clean.contains(MARKER_PREFIX) {
                            continue;
                        }
                        acc.push(clean);
                    }
                    Some(PumpEvent::Stderr(line)) => {
                        if in_window {
                            acc.push(output::clean_line(&line));
                        }
                    }
                    Some(PumpEvent::Eof) | None => {
                        tracing::warn!(session = %self.session_id, "debugger exited mid-command");
                        self.set_status(ProcessStatus::Exited);
                        return ExecOutcome {
                            output: acc.text(),
                            verdict: ExecVerdict::ChildExited,
                        };
                    }
                },
                () = cancel.cancelled() => {
                    return self.drain_after_interrupt(io, acc, in_window).await;
                }
            }
        }
    }

    /// Cooperative cancellation: interrupt the child, then give it a bounded
    /// grace window to reach the End echo. A child that stays silent is left
    /// for the supervisor (verdict `InterruptedHung`).
    async fn drain_after_interrupt(
        &self,
        io: &mut ChildIo,
        mut acc: Accumulator,
        mut in_window: bool,
    ) -> ExecOutcome {
        if let Err(e) = self.interrupt() {
            tracing::debug!(session = %self.session_id, error = %e, "interrupt failed");
        }

        let deadline = tokio::time::Instant::now() + self.config.interrupt_grace;
        loop {
            match tokio::time::timeout_at(deadline, io.events.recv()).await {
                Ok(Some(PumpEvent::Stdout(line))) => {
                    let clean = output::clean_line(&line);
                    if !in_window {
                        if clean == START_MARKER {
                            in_window = true;
                        }
                        continue;
                    }
                    if clean == END_MARKER {
                        self.set_status(ProcessStatus::Idle);
                        return ExecOutcome {
                            output: acc.text(),
                            verdict: ExecVerdict::InterruptedClean,
                        };
                    }
                    if clean.starts_with(".echo ") && clean.contains(MARKER_PREFIX) {
                        continue;
                    }
                    acc.push(clean);
                }
                Ok(Some(PumpEvent::Stderr(_))) => {}
                Ok(Some(PumpEvent::Eof)) | Ok(None) => {
                    self.set_status(ProcessStatus::Exited);
                    return ExecOutcome {
                        output: acc.text(),
                        verdict: ExecVerdict::ChildExited,
                    };
                }
                Err(_) => {
                    return ExecOutcome {
                        output: acc.text(),
                        verdict: ExecVerdict::InterruptedHung,
                    };
                }
            }
        }
    }
}

/// Line accumulator with a byte cap. Past the cap, lines are dropped but the
/// stream keeps draining so the End echo is still observed.
struct Accumulator {
    lines: Vec<String>,
    bytes: usize,
    cap: usize,
    overflowed: bool,
}

impl Accumulator {
    fn new(cap: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            cap,
            overflowed: false,
        }
    }

    fn push(&mut self, line: String) {
        if self.overflowed {
            return;
        }
        self.bytes += line.len() + 1;
        if self.bytes > self.cap {
            self.overflowed = true;
            return;
        }
        self.lines.push(line);
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }
}

async fn write_line(
    stdin: &mut (impl tokio::io::AsyncWrite + Unpin + ?Sized),
    text: &str,
) -> std::io::Result<()> {
    stdin.write_all(text.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
