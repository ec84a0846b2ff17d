// SPDX-License-Identifier: MIT OR Apache-2.0
//! One run: state machine, subscribers, and the bounded fanout queue.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use theory_core::cancel::CancelFlag;
use theory_core::frame::{Role, WsFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the per-run fanout queue.
pub const FANOUT_CAPACITY: usize = 2048;

/// Deadline for delivering one frame to one subscriber before that
/// subscriber is dropped.
pub const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, no client yet.
    Pending,
    /// Worker is executing.
    Running,
    /// Advisory pause; the worker is not suspended.
    Paused,
    /// A controller preempted the run. Terminal.
    Preempted,
    /// Worker returned a success envelope. Terminal.
    Completed,
    /// Worker returned an error envelope or died. Terminal.
    Error,
}

impl RunState {
    /// Terminal states cannot be left.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Preempted | Self::Completed | Self::Error)
    }
}

/// One registered WebSocket connection.
pub struct Subscriber {
    /// Connection id unique within the supervisor.
    pub id: u64,
    /// Role the connection bound with.
    pub role: Role,
    /// Per-subscriber delivery channel; the connection task forwards
    /// frames from here onto the socket.
    pub tx: mpsc::Sender<WsFrame>,
}

/// Token and wall-time caps for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Budgets {
    /// Token cap, when set.
    pub tokens: Option<u64>,
    /// Wall-time cap in seconds, when set.
    pub time_s: Option<u64>,
}

/// In-memory state of one execution.
///
/// Owned by the supervisor's run registry and never escapes the process.
pub struct Run {
    /// Execution id this run is keyed by.
    pub execution_id: String,
    state: Mutex<RunState>,
    budgets: Mutex<Budgets>,
    subscribers: Mutex<Vec<Subscriber>>,
    fanout_tx: mpsc::Sender<Option<WsFrame>>,
    fanout_task: Mutex<Option<JoinHandle<()>>>,
    /// Cooperative cancel flag mirrored into the worker.
    pub cancel: CancelFlag,
    worker: Mutex<Option<std::sync::Arc<dyn crate::worker::WorkerControl>>>,
    terminal_enqueued: AtomicBool,
    started: AtomicBool,
}

impl Run {
    /// Create a run in `Pending` and start its fanout task.
    #[must_use]
    pub fn new(execution_id: impl Into<String>) -> std::sync::Arc<Self> {
        let (fanout_tx, fanout_rx) = mpsc::channel(FANOUT_CAPACITY);
        let run = std::sync::Arc::new(Self {
            execution_id: execution_id.into(),
            state: Mutex::new(RunState::Pending),
            budgets: Mutex::new(Budgets::default()),
            subscribers: Mutex::new(Vec::new()),
            fanout_tx,
            fanout_task: Mutex::new(None),
            cancel: CancelFlag::new(),
            worker: Mutex::new(None),
            terminal_enqueued: AtomicBool::new(false),
            started: AtomicBool::new(false),
        });
        let task = tokio::spawn(fanout_loop(run.clone(), fanout_rx));
        *run.fanout_task.lock().expect("fanout task lock poisoned") = Some(task);
        run
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock().expect("run state lock poisoned")
    }

    /// Transition to `next` unless the run is already terminal.
    /// Returns the state actually in effect afterwards.
    pub fn transition(&self, next: RunState) -> RunState {
        let mut guard = self.state.lock().expect("run state lock poisoned");
        if !guard.is_terminal() {
            debug!(execution_id = %self.execution_id, from = ?*guard, to = ?next, "run transition");
            *guard = next;
        }
        *guard
    }

    /// Current budgets.
    #[must_use]
    pub fn budgets(&self) -> Budgets {
        *self.budgets.lock().expect("budgets lock poisoned")
    }

    /// Merge new caps into the budgets and return the result.
    pub fn set_budgets(&self, tokens: Option<u64>, time_s: Option<u64>) -> Budgets {
        let mut guard = self.budgets.lock().expect("budgets lock poisoned");
        if tokens.is_some() {
            guard.tokens = tokens;
        }
        if time_s.is_some() {
            guard.time_s = time_s;
        }
        *guard
    }

    /// Mark the run as started exactly once. Returns `true` for the caller
    /// that won and should spawn the worker.
    pub fn claim_start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Attach the spawned worker's control surface.
    pub fn bind_worker(&self, control: std::sync::Arc<dyn crate::worker::WorkerControl>) {
        *self.worker.lock().expect("worker lock poisoned") = Some(control);
    }

    /// The worker control surface, when a worker has been spawned.
    #[must_use]
    pub fn worker_control(&self) -> Option<std::sync::Arc<dyn crate::worker::WorkerControl>> {
        self.worker.lock().expect("worker lock poisoned").clone()
    }

    /// Register a subscriber; returns the receiving end the connection
    /// task forwards to the socket.
    pub fn add_subscriber(&self, id: u64, role: Role) -> mpsc::Receiver<WsFrame> {
        let (tx, rx) = mpsc::channel(FANOUT_CAPACITY);
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.push(Subscriber { id, role, tx });
        debug!(execution_id = %self.execution_id, conn = id, role = %role, count = subs.len(), "subscriber added");
        rx
    }

    /// Remove a subscriber by connection id.
    pub fn remove_subscriber(&self, id: u64) {
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.retain(|s| s.id != id);
        debug!(execution_id = %self.execution_id, conn = id, count = subs.len(), "subscriber removed");
    }

    /// Returns `true` when no connection of any role remains.
    #[must_use]
    pub fn has_no_subscribers(&self) -> bool {
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .is_empty()
    }

    /// Enqueue a frame for fanout.
    ///
    /// Backpressure policy: a full queue drops `Token` frames silently;
    /// every other kind waits for capacity. At most one `RunResult` is
    /// ever enqueued; later terminals are discarded.
    pub async fn emit(&self, frame: WsFrame) {
        if frame.is_terminal() && self.terminal_enqueued.swap(true, Ordering::SeqCst) {
            warn!(execution_id = %self.execution_id, "duplicate terminal frame discarded");
            return;
        }
        if frame.is_droppable() {
            if let Err(mpsc::error::TrySendError::Full(_)) = self.fanout_tx.try_send(Some(frame)) {
                // Tokens are fine-grained; dropping under pressure is the contract.
            }
        } else {
            let _ = self.fanout_tx.send(Some(frame)).await;
        }
    }

    /// Returns `true` once a terminal frame has been enqueued.
    #[must_use]
    pub fn terminal_seen(&self) -> bool {
        self.terminal_enqueued.load(Ordering::SeqCst)
    }

    /// Enqueue the fanout sentinel and await the fanout task, bounded.
    /// Called at GC time.
    pub async fn shutdown_fanout(&self) {
        let _ = self.fanout_tx.send(None).await;
        let task = self
            .fanout_task
            .lock()
            .expect("fanout task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }

    /// Build a lifecycle event frame carrying who triggered it.
    #[must_use]
    pub fn phase_event(phase: &str, by: u64, extra: BTreeMap<String, serde_json::Value>) -> WsFrame {
        let mut fields = extra;
        fields.insert("by".into(), serde_json::json!(format!("conn-{by}")));
        WsFrame::phase_with(phase, fields)
    }
}

/// Per-run fanout loop: drain the queue, deliver each frame to every
/// current subscriber in order, drop subscribers that fail or stall.
async fn fanout_loop(run: std::sync::Arc<Run>, mut rx: mpsc::Receiver<Option<WsFrame>>) {
    while let Some(item) = rx.recv().await {
        let Some(frame) = item else { break };
        let targets: Vec<(u64, mpsc::Sender<WsFrame>)> = {
            let subs = run.subscribers.lock().expect("subscribers lock poisoned");
            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in targets {
            let send = tokio::time::timeout(SUBSCRIBER_SEND_TIMEOUT, tx.send(frame.clone()));
            if send.await.map(|r| r.is_err()).unwrap_or(true) {
                dead.push(id);
            }
        }
        for id in dead {
            warn!(execution_id = %run.execution_id, conn = id, "dropping unresponsive subscriber");
            run.remove_subscriber(id);
        }
    }
}
