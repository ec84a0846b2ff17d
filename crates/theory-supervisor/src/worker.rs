// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker spawning and process control.
//!
//! Production workers are separate OS processes: the supervisor writes the
//! payload as one JSON line on the worker's stdin, reads `theory.run.v1`
//! frames as JSON lines from its stdout, and cancels cooperatively by
//! writing a control line back. Escalation is SIGTERM, then SIGKILL.
//!
//! The [`WorkerFactory`] seam exists so tests (and the e2e harness) can run
//! tools on an in-process task with identical protocol behavior.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use theory_core::cancel::CancelFlag;
use theory_core::frame::WsFrame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Capacity of the worker → supervisor event pipe.
const WORKER_EVENT_CAPACITY: usize = 2048;

/// Control surface over a spawned worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Ask the worker to stop cooperatively.
    async fn request_cancel(&self);
    /// Soft kill (SIGTERM for processes).
    async fn soft_kill(&self);
    /// Hard kill (SIGKILL for processes).
    async fn hard_kill(&self);
    /// Returns `true` while the worker has not exited.
    async fn is_alive(&self) -> bool;
    /// Reap the worker, waiting at most `timeout`.
    async fn reap(&self, timeout: Duration);
}

/// A spawned worker: its event stream plus its control surface.
pub struct WorkerHandle {
    /// Frames produced by the worker, ending when it exits.
    pub events: mpsc::Receiver<WsFrame>,
    /// Control surface.
    pub control: Arc<dyn WorkerControl>,
}

/// Spawns one worker per run.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Spawn a worker for `payload`, wired to `cancel`.
    async fn spawn(&self, payload: Value, cancel: CancelFlag) -> anyhow::Result<WorkerHandle>;
}

// ---------------------------------------------------------------------------
// Process-backed workers
// ---------------------------------------------------------------------------

/// Launches workers as OS subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: String,
    args: Vec<String>,
}

impl ProcessWorkerFactory {
    /// Launch `program` with `args` per worker.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Factory from the `THEORY_WORKER_BIN` environment hint, defaulting
    /// to `theory-worker` on PATH.
    #[must_use]
    pub fn from_env() -> Self {
        let program =
            std::env::var("THEORY_WORKER_BIN").unwrap_or_else(|_| "theory-worker".into());
        Self::new(program, Vec::new())
    }
}

struct ProcessControl {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl ProcessControl {
    async fn pid(&self) -> Option<i32> {
        self.child.lock().await.id().map(|p| p as i32)
    }
}

#[async_trait]
impl WorkerControl for ProcessControl {
    async fn request_cancel(&self) {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let line = b"{\"kind\":\"control\",\"content\":{\"op\":\"preempt\"}}\n";
            if stdin.write_all(line).await.is_err() {
                *guard = None;
            } else {
                let _ = stdin.flush().await;
            }
        }
    }

    async fn soft_kill(&self) {
        if let Some(pid) = self.pid().await {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    async fn hard_kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn reap(&self, timeout: Duration) {
        let mut child = self.child.lock().await;
        let _ = tokio::time::timeout(timeout, child.wait()).await;
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, payload: Value, cancel: CancelFlag) -> anyhow::Result<WorkerHandle> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("worker stdin is piped");
        let stdout = child.stdout.take().expect("worker stdout is piped");
        let stderr = child.stderr.take().expect("worker stderr is piped");

        // Hand the payload over as a single JSON line.
        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;

        let (tx, rx) = mpsc::channel(WORKER_EVENT_CAPACITY);

        // Pump stdout JSONL into frames. The channel closing signals exit.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WsFrame>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "worker emitted a non-frame line");
                    }
                }
            }
        });

        // Surface worker stderr at debug level for operators.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "worker", "{line}");
            }
        });

        let control = Arc::new(ProcessControl {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
        });

        // Mirror the shared cancel flag into a stdin control line.
        let cancel_control = control.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            cancel_control.request_cancel().await;
        });

        Ok(WorkerHandle {
            events: rx,
            control,
        })
    }
}

// ---------------------------------------------------------------------------
// Task-backed workers (tests, e2e harness)
// ---------------------------------------------------------------------------

/// Signature of an in-process tool body.
pub type TaskWorkerFn = Arc<
    dyn Fn(
            Value,
            mpsc::Sender<WsFrame>,
            CancelFlag,
        ) -> futures::future::BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Runs workers as tokio tasks inside the supervisor process.
///
/// Protocol behavior (frames, terminal discipline, cancellation) is
/// identical to process workers; only the isolation differs, which is why
/// this factory is reserved for tests.
#[derive(Clone)]
pub struct TaskWorkerFactory {
    body: TaskWorkerFn,
}

impl TaskWorkerFactory {
    /// Wrap a tool body.
    pub fn new(body: TaskWorkerFn) -> Self {
        Self { body }
    }
}

struct TaskControl {
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancelFlag,
}

#[async_trait]
impl WorkerControl for TaskControl {
    async fn request_cancel(&self) {
        self.cancel.cancel();
    }

    async fn soft_kill(&self) {
        self.cancel.cancel();
    }

    async fn hard_kill(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn is_alive(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    async fn reap(&self, timeout: Duration) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

#[async_trait]
impl WorkerFactory for TaskWorkerFactory {
    async fn spawn(&self, payload: Value, cancel: CancelFlag) -> anyhow::Result<WorkerHandle> {
        let (tx, rx) = mpsc::channel(WORKER_EVENT_CAPACITY);
        let body = self.body.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            body(payload, tx, task_cancel).await;
        });
        Ok(WorkerHandle {
            events: rx,
            control: Arc::new(TaskControl {
                handle: Mutex::new(Some(handle)),
                cancel,
            }),
        })
    }
}

/// Escalate against a worker that ignores cooperative cancel: wait one
/// grace window, soft kill, wait another, hard kill.
pub async fn escalate(control: Arc<dyn WorkerControl>, grace: Duration) {
    tokio::time::sleep(grace).await;
    if control.is_alive().await {
        warn!("worker ignored cancel; sending soft kill");
        control.soft_kill().await;
        tokio::time::sleep(grace).await;
        if control.is_alive().await {
            warn!("worker survived soft kill; sending hard kill");
            control.hard_kill().await;
        }
    }
    control.reap(Duration::from_secs(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_factory() -> TaskWorkerFactory {
        TaskWorkerFactory::new(Arc::new(|payload, tx, _cancel| {
            Box::pin(async move {
                let _ = tx
                    .send(WsFrame::Token {
                        text: payload["inputs"]["text"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .await;
            })
        }))
    }

    #[tokio::test]
    async fn task_worker_streams_and_exits() {
        let factory = echo_factory();
        let mut handle = factory
            .spawn(
                serde_json::json!({"inputs": {"text": "hi"}}),
                CancelFlag::new(),
            )
            .await
            .unwrap();
        let frame = handle.events.recv().await.unwrap();
        assert!(matches!(frame, WsFrame::Token { text } if text == "hi"));
        // Channel closes when the task body returns.
        assert!(handle.events.recv().await.is_none());
        handle.control.reap(Duration::from_secs(1)).await;
        assert!(!handle.control.is_alive().await);
    }

    #[tokio::test]
    async fn task_cancel_sets_flag() {
        let observed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observed_in_body = observed.clone();
        let factory = TaskWorkerFactory::new(Arc::new(move |_payload, _tx, cancel| {
            let observed = observed_in_body.clone();
            Box::pin(async move {
                cancel.cancelled().await;
                observed.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        }));
        let cancel = CancelFlag::new();
        let handle = factory
            .spawn(serde_json::json!({}), cancel.clone())
            .await
            .unwrap();
        handle.control.request_cancel().await;
        handle.control.reap(Duration::from_secs(1)).await;
        assert!(observed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn escalation_hard_kills_a_stuck_task() {
        let factory = TaskWorkerFactory::new(Arc::new(|_payload, _tx, _cancel| {
            Box::pin(async move {
                // Ignores cancellation entirely.
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            })
        }));
        let handle = factory
            .spawn(serde_json::json!({}), CancelFlag::new())
            .await
            .unwrap();
        let control = handle.control.clone();
        escalate(control.clone(), Duration::from_millis(20)).await;
        assert!(!control.is_alive().await);
    }
}
