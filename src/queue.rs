//! Per-session command queue: FIFO scheduling, lifecycle bookkeeping,
//! timeouts, cancellation, and batching.
//!
//! One worker task per queue drains the FIFO. Before each dispatch it asks
//! the batch processor whether a prefix of the queue can be merged; during a
//! dispatch it multiplexes the execution future against the timeout service's
//! expiry channel (timeout entries cancel the dispatch, heartbeat entries
//! emit progress notifications). Failures never escape the worker -- they are
//! captured onto the command records so result readers return normally.

use crate::batch::{BatchProcessor, DispatchPlan};
use crate::command::{Command, CommandInfo, CommandState, format_command_id};
use crate::config::EngineConfig;
use crate::engine::EngineEvent;
use crate::error::{EngineError, EngineResult};
use crate::notify::{self, NotificationHub};
use crate::process::{ExecVerdict, FaultReason, ProcessSession, ProcessStatus};
use crate::sys::Clock;
use crate::timeout::{Expiry, ExpiryKind, TimeoutService};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why an in-flight dispatch was cancelled. Decides the terminal state the
/// affected commands land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Timeout,
    Recovery,
    Shutdown,
}

impl CancelReason {
    fn message(self) -> &'static str {
        match self {
            Self::User => "cancelled by user",
            Self::Timeout => "command timed out",
            Self::Recovery => "cancelled: session recovery",
            Self::Shutdown => "cancelled: session closing",
        }
    }
}

struct QueueState {
    commands: HashMap<String, Command>,
    /// Ids still waiting to be dispatched, FIFO.
    fifo: VecDeque<String>,
    /// Every id ever issued, in issue order (for stable listings).
    order: Vec<String>,
    /// Ids whose `queued` notification has not gone out yet. The worker
    /// never dispatches past one of these, so a command's `executing`
    /// notification cannot overtake its `queued` one.
    unannounced: HashSet<String>,
}

struct CurrentDispatch {
    dispatch_id: String,
    source_ids: Vec<String>,
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

/// FIFO command queue for one session.
pub struct CommandQueue {
    session_id: String,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    process: Arc<ProcessSession>,
    batcher: Arc<BatchProcessor>,
    hub: Arc<NotificationHub>,
    timeouts: Arc<TimeoutService>,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<QueueState>,
    counter: AtomicU64,
    wake: Notify,
    shutdown: CancellationToken,
    current: Mutex<Option<CurrentDispatch>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
        process: Arc<ProcessSession>,
        batcher: Arc<BatchProcessor>,
        hub: Arc<NotificationHub>,
        timeouts: Arc<TimeoutService>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            config,
            clock,
            process,
            batcher,
            hub,
            timeouts,
            events,
            state: Mutex::new(QueueState {
                commands: HashMap::new(),
                fifo: VecDeque::new(),
                order: Vec::new(),
                unannounced: HashSet::new(),
            }),
            counter: AtomicU64::new(0),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Register with the timeout service and spawn the worker task.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.timeouts.register_handler(&self.session_id, tx);
        let queue = self.clone();
        let handle = tokio::spawn(async move { queue.worker_loop(rx).await });
        *self.worker.lock().expect("worker slot poisoned") = Some(handle);
    }

    /// Mint the next command id from the per-session monotonic counter.
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format_command_id(&self.session_id, n)
    }

    /// Number of commands not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        let st = self.state.lock().expect("queue state poisoned");
        st.commands
            .values()
            .filter(|c| !c.state.is_terminal())
            .count()
    }

    /// Number of commands still waiting for dispatch.
    pub fn queued_count(&self) -> usize {
        self.state.lock().expect("queue state poisoned").fifo.len()
    }

    /// Enqueue a command. Non-blocking; fails with `QueueFull` above the
    /// soft cap instead of applying backpressure.
    pub async fn enqueue(&self, text: &str) -> EngineResult<String> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::UnknownSession(self.session_id.clone()));
        }

        let id = {
            let mut st = self.state.lock().expect("queue state poisoned");
            let pending = st
                .commands
                .values()
                .filter(|c| !c.state.is_terminal())
                .count();
            if pending >= self.config.queue_capacity {
                return Err(EngineError::QueueFull {
                    pending,
                    capacity: self.config.queue_capacity,
                });
            }
            let id = self.next_id();
            let cmd = Command::new(id.clone(), text.to_string(), self.clock.now());
            st.order.push(id.clone());
            st.fifo.push_back(id.clone());
            st.unannounced.insert(id.clone());
            st.commands.insert(id.clone(), cmd);
            id
        };

        tracing::debug!(session = %self.session_id, command = %id, "command enqueued");

        self.publish_status(&id, text, CommandState::Queued, None, None)
            .await;
        let _ = self.events.send(EngineEvent::CommandStateChanged {
            session_id: self.session_id.clone(),
            command_id: id.clone(),
            state: CommandState::Queued,
        });

        self.state
            .lock()
            .expect("queue state poisoned")
            .unannounced
            .remove(&id);
        self.wake.notify_one();

        Ok(id)
    }

    /// Snapshot of one command.
    pub fn get_info(&self, command_id: &str) -> EngineResult<CommandInfo> {
        let st = self.state.lock().expect("queue state poisoned");
        st.commands
            .get(command_id)
            .map(|c| self.info_with_batch(c))
            .ok_or_else(|| EngineError::UnknownCommand(command_id.to_string()))
    }

    /// Snapshot of every command ever issued on this session, in issue order.
    pub fn list_infos(&self) -> Vec<CommandInfo> {
        let st = self.state.lock().expect("queue state poisoned");
        st.order
            .iter()
            .filter_map(|id| st.commands.get(id))
            .map(|c| self.info_with_batch(c))
            .collect()
    }

    fn info_with_batch(&self, cmd: &Command) -> CommandInfo {
        let mut info = cmd.info();
        if info.batch_command_id.is_none() {
            info.batch_command_id = self.batcher.batch_command_id(&self.session_id, &cmd.id);
        }
        info
    }

    /// Await a command's terminal state and return its final snapshot. Wakes
    /// immediately when the command is already terminal.
    pub async fn wait_result(&self, command_id: &str) -> EngineResult<CommandInfo> {
        let mut rx = {
            let st = self.state.lock().expect("queue state poisoned");
            let cmd = st
                .commands
                .get(command_id)
                .ok_or_else(|| EngineError::UnknownCommand(command_id.to_string()))?;
            if cmd.state.is_terminal() {
                return Ok(self.info_with_batch(cmd));
            }
            cmd.done_rx()
        };

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.get_info(command_id)
    }

    /// Cancel one command. Queued commands transition straight to
    /// `Cancelled`; an executing command is cancelled cooperatively and its
    /// final state is decided by the execution outcome. Returns whether a
    /// transition was effected.
    pub async fn cancel(&self, command_id: &str, reason: CancelReason) -> EngineResult<bool> {
        enum Action {
            None,
            Finalized(String),
            CancelRunning,
        }

        let action = {
            let mut st = self.state.lock().expect("queue state poisoned");
            let eligible_for_inplace_cancel = st.fifo.iter().any(|id| id == command_id)
                && !st.unannounced.contains(command_id);
            let cmd = st
                .commands
                .get_mut(command_id)
                .ok_or_else(|| EngineError::UnknownCommand(command_id.to_string()))?;
            match cmd.state {
                // Only announced commands still in the FIFO can be cancelled
                // in place; one mid-enqueue or just popped for dispatch is
                // handled like an executing command so its status
                // notifications stay ordered.
                CommandState::Queued if eligible_for_inplace_cancel => {
                    let now = self.clock.now();
                    cmd.error_message = Some(reason.message().to_string());
                    cmd.transition(CommandState::Cancelled, now);
                    let text = cmd.text.clone();
                    st.fifo.retain(|id| id != command_id);
                    Action::Finalized(text)
                }
                CommandState::Queued | CommandState::Executing => Action::CancelRunning,
                _ => Action::None,
            }
        };

        match action {
            Action::None => Ok(false),
            Action::Finalized(text) => {
                self.publish_status(
                    command_id,
                    &text,
                    CommandState::Cancelled,
                    Some(reason.message().to_string()),
                    None,
                )
                .await;
                let _ = self.events.send(EngineEvent::CommandStateChanged {
                    session_id: self.session_id.clone(),
                    command_id: command_id.to_string(),
                    state: CommandState::Cancelled,
                });
                Ok(true)
            }
            Action::CancelRunning => Ok(self.cancel_current_if_member(command_id, reason)),
        }
    }

    /// Cancel every non-terminal command; returns how many were affected.
    pub async fn cancel_all(&self, reason: CancelReason) -> usize {
        let ids: Vec<String> = {
            let st = self.state.lock().expect("queue state poisoned");
            st.order
                .iter()
                .filter(|id| {
                    st.commands
                        .get(*id)
                        .is_some_and(|c| !c.state.is_terminal())
                })
                .cloned()
                .collect()
        };

        let mut count = 0;
        for id in ids {
            if matches!(self.cancel(&id, reason).await, Ok(true)) {
                count += 1;
            }
        }
        count
    }

    /// Cancel only the dispatch currently on the wire (used by recovery:
    /// queued commands are retained). Returns the affected source ids.
    pub fn cancel_executing(&self, reason: CancelReason) -> Vec<String> {
        let current = self.current.lock().expect("current dispatch poisoned");
        match current.as_ref() {
            Some(dispatch) => {
                dispatch
                    .reason
                    .lock()
                    .expect("cancel reason poisoned")
                    .get_or_insert(reason);
                dispatch.token.cancel();
                dispatch.source_ids.clone()
            }
            None => Vec::new(),
        }
    }

    fn cancel_current_if_member(&self, command_id: &str, reason: CancelReason) -> bool {
        let current = self.current.lock().expect("current dispatch poisoned");
        match current.as_ref() {
            Some(dispatch)
                if dispatch.dispatch_id == command_id
                    || dispatch.source_ids.iter().any(|id| id == command_id) =>
            {
                dispatch
                    .reason
                    .lock()
                    .expect("cancel reason poisoned")
                    .get_or_insert(reason);
                dispatch.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop the worker and fail everything still pending. Called on session
    /// close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_all(CancelReason::Shutdown).await;
        self.wake.notify_one();
        let handle = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.timeouts.unregister_handler(&self.session_id);
        self.batcher.clear_session(&self.session_id);
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, mut expiry_rx: mpsc::UnboundedReceiver<Expiry>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.wake.notified() => {}
            }

            loop {
                if self.shutdown.is_cancelled() {
                    return;
                }
                if !self.wait_process_idle().await {
                    return;
                }

                let Some(plan) = self.plan_next() else { break };
                self.run_dispatch(plan, &mut expiry_rx).await;
            }
        }
    }

    /// Block until the process can take a command. Returns false on shutdown.
    async fn wait_process_idle(&self) -> bool {
        let mut status_rx = self.process.subscribe_status();
        loop {
            if *status_rx.borrow_and_update() == ProcessStatus::Idle {
                return true;
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Pop the next dispatch off the FIFO, merging a batch when worthwhile.
    /// Stops at the first command whose `queued` notification is still in
    /// flight (its enqueuer will wake the worker again).
    fn plan_next(&self) -> Option<DispatchPlan> {
        let mut st = self.state.lock().expect("queue state poisoned");
        let pending: Vec<(String, String)> = st
            .fifo
            .iter()
            .take_while(|id| !st.unannounced.contains(*id))
            .filter_map(|id| st.commands.get(id).map(|c| (c.id.clone(), c.text.clone())))
            .collect();
        if pending.is_empty() {
            return None;
        }

        let plan = self
            .batcher
            .plan(&self.session_id, &pending, || self.next_id());

        let taken: Vec<&String> = match &plan {
            DispatchPlan::Single { command_id, .. } => vec![command_id],
            DispatchPlan::Batch { source_ids, .. } => source_ids.iter().collect(),
        };
        for id in taken {
            st.fifo.retain(|q| q != id);
        }
        Some(plan)
    }

    async fn run_dispatch(
        &self,
        plan: DispatchPlan,
        expiry_rx: &mut mpsc::UnboundedReceiver<Expiry>,
    ) {
        let (dispatch_id, text, source_ids) = match plan {
            DispatchPlan::Single { command_id, text } => {
                (command_id.clone(), text, vec![command_id])
            }
            DispatchPlan::Batch {
                batch_id,
                text,
                source_ids,
            } => (batch_id, text, source_ids),
        };

        // Transition sources to Executing. One cancelled in the
        // pop-to-dispatch window stays terminal and gets no notifications.
        let now = self.clock.now();
        let mut texts: HashMap<String, String> = HashMap::new();
        let mut executing: Vec<String> = Vec::new();
        {
            let mut st = self.state.lock().expect("queue state poisoned");
            for id in &source_ids {
                if let Some(cmd) = st.commands.get_mut(id) {
                    texts.insert(id.clone(), cmd.text.clone());
                    if cmd.transition(CommandState::Executing, now) {
                        if *id != dispatch_id {
                            cmd.batch_command_id = Some(dispatch_id.clone());
                        }
                        executing.push(id.clone());
                    }
                }
            }
        }

        for id in &executing {
            let text = texts.get(id).cloned().unwrap_or_default();
            self.publish_status(id, &text, CommandState::Executing, None, None)
                .await;
            let _ = self.events.send(EngineEvent::CommandStateChanged {
                session_id: self.session_id.clone(),
                command_id: id.clone(),
                state: CommandState::Executing,
            });
        }

        let token = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None::<CancelReason>));
        *self.current.lock().expect("current dispatch poisoned") = Some(CurrentDispatch {
            dispatch_id: dispatch_id.clone(),
            source_ids: source_ids.clone(),
            token: token.clone(),
            reason: reason.clone(),
        });

        let timeout_seq =
            self.timeouts
                .schedule_timeout(&self.session_id, &dispatch_id, self.config.command_timeout);
        let heartbeat_seq = self.timeouts.schedule_heartbeat(
            &self.session_id,
            &dispatch_id,
            self.config.heartbeat_interval,
        );
        let started = tokio::time::Instant::now();

        let exec = self.process.execute_one(&text, &token);
        tokio::pin!(exec);

        let mut expiry_open = true;
        let outcome = loop {
            if !expiry_open {
                break exec.as_mut().await;
            }
            tokio::select! {
                outcome = &mut exec => break outcome,
                expiry = expiry_rx.recv() => {
                    let Some(expiry) = expiry else {
                        expiry_open = false;
                        continue;
                    };
                    if expiry.command_id != dispatch_id {
                        continue; // stale entry from a previous dispatch
                    }
                    match expiry.kind {
                        ExpiryKind::Timeout => {
                            tracing::warn!(
                                session = %self.session_id,
                                dispatch = %dispatch_id,
                                "command deadline reached, cancelling"
                            );
                            reason
                                .lock()
                                .expect("cancel reason poisoned")
                                .get_or_insert(CancelReason::Timeout);
                            token.cancel();
                        }
                        ExpiryKind::Heartbeat => {
                            let elapsed = started.elapsed().as_secs_f64();
                            for id in &executing {
                                let text = texts.get(id).cloned().unwrap_or_default();
                                self.hub
                                    .command_heartbeat(notify::heartbeat(
                                        &self.session_id,
                                        id,
                                        &text,
                                        (elapsed * 1000.0).round() / 1000.0,
                                        self.clock.now(),
                                    ))
                                    .await;
                            }
                        }
                    }
                }
            }
        };

        self.timeouts.cancel(timeout_seq);
        self.timeouts.cancel(heartbeat_seq);
        *self.current.lock().expect("current dispatch poisoned") = None;
        let reason = reason.lock().expect("cancel reason poisoned").take();

        self.finalize_dispatch(&dispatch_id, &source_ids, &texts, outcome, reason)
            .await;
    }

    async fn finalize_dispatch(
        &self,
        dispatch_id: &str,
        source_ids: &[String],
        texts: &HashMap<String, String>,
        outcome: crate::process::ExecOutcome,
        reason: Option<CancelReason>,
    ) {
        let is_batch = source_ids.len() > 1 || source_ids[0] != dispatch_id;

        // (id, state, output, error) per source command.
        let mut results: Vec<(String, CommandState, String, Option<String>)> = Vec::new();

        match outcome.verdict {
            ExecVerdict::Completed => {
                if is_batch {
                    match BatchProcessor::unbatch_results(&outcome.output, source_ids) {
                        Ok(split) => {
                            for result in split {
                                results.push((
                                    result.command_id,
                                    CommandState::Completed,
                                    result.output,
                                    None,
                                ));
                            }
                        }
                        Err(mismatch) => {
                            tracing::error!(
                                session = %self.session_id,
                                batch = dispatch_id,
                                %mismatch,
                                "unbatch failed"
                            );
                            for id in source_ids {
                                results.push((
                                    id.clone(),
                                    CommandState::Failed,
                                    outcome.output.clone(),
                                    Some(mismatch.to_string()),
                                ));
                            }
                        }
                    }
                } else {
                    results.push((
                        source_ids[0].clone(),
                        CommandState::Completed,
                        outcome.output,
                        None,
                    ));
                }
            }
            ExecVerdict::Overflow => {
                let error = format!(
                    "output exceeded {} bytes and was truncated",
                    self.config.max_output_bytes
                );
                for id in source_ids {
                    results.push((
                        id.clone(),
                        CommandState::Failed,
                        outcome.output.clone(),
                        Some(error.clone()),
                    ));
                }
            }
            ExecVerdict::InterruptedClean => {
                let reason = reason.unwrap_or(CancelReason::User);
                let state = match reason {
                    CancelReason::Timeout => CommandState::TimedOut,
                    _ => CommandState::Cancelled,
                };
                for id in source_ids {
                    results.push((
                        id.clone(),
                        state,
                        outcome.output.clone(),
                        Some(reason.message().to_string()),
                    ));
                }
            }
            ExecVerdict::InterruptedHung => {
                let reason = reason.unwrap_or(CancelReason::User);
                // Promoted cancellation: the child never acknowledged the
                // interrupt, so the supervisor must replace it.
                if reason != CancelReason::Recovery {
                    self.process.mark_hung(match reason {
                        CancelReason::Timeout => FaultReason::CommandTimedOut,
                        _ => FaultReason::CancelUnresponsive,
                    });
                }
                for id in source_ids {
                    results.push((
                        id.clone(),
                        CommandState::TimedOut,
                        outcome.output.clone(),
                        Some(format!("{} (debugger unresponsive)", reason.message())),
                    ));
                }
            }
            ExecVerdict::ChildExited => {
                for id in source_ids {
                    results.push((
                        id.clone(),
                        CommandState::Failed,
                        outcome.output.clone(),
                        Some("debugger process exited during execution".to_string()),
                    ));
                }
            }
        }

        let now = self.clock.now();
        let transitioned: Vec<bool> = {
            let mut st = self.state.lock().expect("queue state poisoned");
            results
                .iter()
                .map(|(id, state, output, error)| {
                    let Some(cmd) = st.commands.get_mut(id) else {
                        return false;
                    };
                    // A command cancelled in the pop-to-dispatch window is
                    // already terminal; its record stays as cancelled.
                    if cmd.state.is_terminal() {
                        return false;
                    }
                    cmd.output = output.clone();
                    cmd.error_message = error.clone();
                    cmd.transition(*state, now)
                })
                .collect()
        };

        for ((id, state, output, error), transitioned) in results.into_iter().zip(transitioned) {
            if !transitioned {
                continue;
            }
            let text = texts.get(&id).cloned().unwrap_or_default();
            let result = (state == CommandState::Completed).then_some(output);
            self.publish_status(&id, &text, state, error, result).await;
            let _ = self.events.send(EngineEvent::CommandStateChanged {
                session_id: self.session_id.clone(),
                command_id: id,
                state,
            });
        }
    }

    async fn publish_status(
        &self,
        command_id: &str,
        text: &str,
        state: CommandState,
        error: Option<String>,
        result: Option<String>,
    ) {
        self.hub
            .command_status(notify::status_for_transition(
                &self.session_id,
                command_id,
                text,
                state,
                error,
                result,
                self.clock.now(),
            ))
            .await;
    }
}
