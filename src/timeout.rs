//! Central deadline service: one ticker for every command timeout and
//! heartbeat in the process.
//!
//! Queues register a per-session channel, then schedule entries against it.
//! The ticker task owns a min-heap of `(due, seq)` entries; on each wake it
//! pops everything due and delivers [`Expiry`] events. Heartbeat entries are
//! rescheduled at their interval, timeout entries are one-shot. Cancellation
//! is by sequence id via tombstones -- entries are cheap, so lazily skipping
//! dead ones on pop beats restructuring the heap.

use crate::sys::Clock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    Timeout,
    Heartbeat,
}

/// Delivered to the owning session's handler channel when an entry comes due.
#[derive(Debug, Clone)]
pub struct Expiry {
    pub session_id: String,
    pub command_id: String,
    pub kind: ExpiryKind,
}

#[derive(Debug)]
struct Entry {
    due: Instant,
    seq: u64,
    expiry: Expiry,
    /// Heartbeats reschedule at this interval; timeouts are one-shot.
    repeat: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Seqs currently in the heap (repeats stay live across reschedules).
    live: HashSet<u64>,
    tombstones: HashSet<u64>,
    handlers: HashMap<String, mpsc::UnboundedSender<Expiry>>,
    next_seq: u64,
}

/// Process-wide timer service. Create once at engine init, [`shutdown`] on
/// engine close.
///
/// [`shutdown`]: TimeoutService::shutdown
pub struct TimeoutService {
    inner: Mutex<Inner>,
    wake: Notify,
    stop: CancellationToken,
}

impl TimeoutService {
    /// Create the service and spawn its ticker task.
    #[must_use]
    pub fn start(clock: Arc<dyn Clock>) -> Arc<Self> {
        let svc = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        });
        let ticker = svc.clone();
        tokio::spawn(async move { ticker.run(clock).await });
        svc
    }

    /// Register the expiry channel for a session. Replaces any previous one.
    pub fn register_handler(&self, session_id: &str, tx: mpsc::UnboundedSender<Expiry>) {
        let mut inner = self.inner.lock().expect("timeout service poisoned");
        inner.handlers.insert(session_id.to_string(), tx);
    }

    /// Drop a session's handler. Entries still in the heap for that session
    /// are discarded when they pop.
    pub fn unregister_handler(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("timeout service poisoned");
        inner.handlers.remove(session_id);
    }

    /// Schedule a one-shot timeout entry. Returns a sequence id for [`cancel`].
    ///
    /// [`cancel`]: TimeoutService::cancel
    pub fn schedule_timeout(&self, session_id: &str, command_id: &str, after: Duration) -> u64 {
        self.schedule(session_id, command_id, ExpiryKind::Timeout, after, None)
    }

    /// Schedule a repeating heartbeat entry.
    pub fn schedule_heartbeat(&self, session_id: &str, command_id: &str, every: Duration) -> u64 {
        self.schedule(
            session_id,
            command_id,
            ExpiryKind::Heartbeat,
            every,
            Some(every),
        )
    }

    fn schedule(
        &self,
        session_id: &str,
        command_id: &str,
        kind: ExpiryKind,
        after: Duration,
        repeat: Option<Duration>,
    ) -> u64 {
        let mut inner = self.inner.lock().expect("timeout service poisoned");
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.live.insert(seq);
        inner.heap.push(Reverse(Entry {
            due: Instant::now() + after,
            seq,
            expiry: Expiry {
                session_id: session_id.to_string(),
                command_id: command_id.to_string(),
                kind,
            },
            repeat,
        }));
        drop(inner);
        self.wake.notify_one();
        seq
    }

    /// Cancel a scheduled entry. Safe to call after it fired; a repeating
    /// entry stops rescheduling.
    pub fn cancel(&self, seq: u64) {
        let mut inner = self.inner.lock().expect("timeout service poisoned");
        if inner.live.remove(&seq) {
            inner.tombstones.insert(seq);
        }
    }

    /// Stop the ticker task.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    async fn run(self: Arc<Self>, clock: Arc<dyn Clock>) {
        loop {
            let (due, next) = self.pop_due();

            for (expiry, handler) in due {
                if handler.send(expiry).is_err() {
                    // Receiver dropped between pop and send; nothing to do.
                }
            }

            let sleep = async {
                match next {
                    Some(at) => {
                        let now = Instant::now();
                        clock.after(at.saturating_duration_since(now)).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = self.stop.cancelled() => break,
                () = self.wake.notified() => {}
                () = sleep => {}
            }
        }
    }

    /// Pop every due, non-tombstoned entry and reschedule repeats. Returns
    /// the due expiries paired with their handlers, plus the next deadline.
    #[allow(clippy::type_complexity)]
    fn pop_due(&self) -> (Vec<(Expiry, mpsc::UnboundedSender<Expiry>)>, Option<Instant>) {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut inner = self.inner.lock().expect("timeout service poisoned");

        while let Some(Reverse(entry)) = inner.heap.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = inner.heap.pop().expect("peeked entry vanished");
            if inner.tombstones.remove(&entry.seq) {
                continue;
            }
            let handler = inner.handlers.get(&entry.expiry.session_id).cloned();
            if let Some(every) = entry.repeat {
                inner.heap.push(Reverse(Entry {
                    due: now + every,
                    seq: entry.seq,
                    expiry: entry.expiry.clone(),
                    repeat: entry.repeat,
                }));
            } else {
                inner.live.remove(&entry.seq);
            }
            let Some(handler) = handler else { continue };
            due.push((entry.expiry, handler));
        }

        let next = inner.heap.peek().map(|Reverse(e)| e.due);
        (due, next)
    }
}
