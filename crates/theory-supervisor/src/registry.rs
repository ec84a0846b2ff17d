// SPDX-License-Identifier: MIT OR Apache-2.0
//! The run registry: execution id → run, control ops, worker lifecycle,
//! and garbage collection.

use crate::run::{Run, RunState};
use crate::worker::{WorkerFactory, escalate};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use theory_core::frame::{ControlFrame, WsFrame};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace window between cancel, soft kill, and hard kill.
    pub grace: Duration,
    /// Digest reported by `/healthz`, normally from `IMAGE_DIGEST`.
    pub image_digest: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            image_digest: std::env::var("IMAGE_DIGEST").unwrap_or_else(|_| "unknown".into()),
        }
    }
}

/// Owns every live [`Run`] in this supervisor process.
pub struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<Run>>>,
    next_conn_id: AtomicU64,
    factory: Arc<dyn WorkerFactory>,
    /// Tunables shared with the HTTP layer.
    pub config: SupervisorConfig,
}

impl RunRegistry {
    /// Create a registry spawning workers through `factory`.
    pub fn new(factory: Arc<dyn WorkerFactory>, config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            factory,
            config,
        })
    }

    /// Allocate a process-unique connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up or create the run for `execution_id`.
    pub async fn get_or_create(&self, execution_id: &str) -> Arc<Run> {
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get(execution_id) {
            return run.clone();
        }
        let run = Run::new(execution_id);
        runs.insert(execution_id.to_string(), run.clone());
        info!(execution_id = %execution_id, "run opened");
        run
    }

    /// Look up an existing run.
    pub async fn get(&self, execution_id: &str) -> Option<Arc<Run>> {
        self.runs.lock().await.get(execution_id).cloned()
    }

    /// Number of live runs. Used by tests to observe GC.
    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Start the run's worker if it is still pending. Called when a client
    /// subscriber joins. The payload travels to the worker verbatim.
    pub async fn start_run(self: &Arc<Self>, run: &Arc<Run>, payload: Value) {
        if !run.claim_start() {
            return;
        }
        run.transition(RunState::Running);
        info!(execution_id = %run.execution_id, "run starting");

        let timeout_s = payload.get("timeout_s").and_then(serde_json::Value::as_u64);
        let spawned = self.factory.spawn(payload, run.cancel.clone()).await;
        let mut handle = match spawned {
            Ok(handle) => {
                run.bind_worker(handle.control.clone());
                handle
            }
            Err(err) => {
                warn!(execution_id = %run.execution_id, error = %err, "worker spawn failed");
                run.transition(RunState::Error);
                run.emit(WsFrame::RunResult(ExecutionEnvelope::error(
                    &run.execution_id,
                    ErrorCode::ErrRuntime,
                    format!("worker spawn failed: {err}"),
                )))
                .await;
                return;
            }
        };

        // Hard-timeout watchdog: past the deadline the run is preempted
        // and the worker walked down the kill ladder.
        if let Some(secs) = timeout_s.filter(|s| *s > 0) {
            let watchdog_run = run.clone();
            let grace = self.config.grace;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if watchdog_run.state().is_terminal() {
                    return;
                }
                warn!(execution_id = %watchdog_run.execution_id, secs, "run timed out");
                watchdog_run.transition(RunState::Preempted);
                watchdog_run.cancel.cancel();
                let mut fields = BTreeMap::new();
                fields.insert("reason".into(), serde_json::json!("timeout"));
                watchdog_run
                    .emit(WsFrame::phase_with("preempted", fields))
                    .await;
                if let Some(control) = watchdog_run.worker_control() {
                    escalate(control, grace).await;
                }
            });
        }

        // Pump worker frames into the fanout queue; synthesize a terminal
        // if the worker dies without one.
        let registry = self.clone();
        let run = run.clone();
        tokio::spawn(async move {
            while let Some(frame) = handle.events.recv().await {
                if let WsFrame::RunResult(envelope) = &frame {
                    let next = if envelope.is_error() {
                        RunState::Error
                    } else {
                        RunState::Completed
                    };
                    let settled = run.transition(next);
                    info!(
                        execution_id = %run.execution_id,
                        status = ?settled,
                        "run settled"
                    );
                }
                run.emit(frame).await;
            }

            // Worker exited. No terminal frame means it died or was killed.
            if !run.terminal_seen() {
                let (code, message) = if run.cancel.is_cancelled() {
                    (ErrorCode::ErrPreempted, "worker preempted before returning a result")
                } else {
                    (ErrorCode::ErrRuntime, "worker exited without a result")
                };
                let state = if code == ErrorCode::ErrPreempted {
                    RunState::Preempted
                } else {
                    RunState::Error
                };
                run.transition(state);
                run.emit(WsFrame::RunResult(ExecutionEnvelope::error(
                    &run.execution_id,
                    code,
                    message,
                )))
                .await;
            }
            handle.control.reap(Duration::from_secs(1)).await;
            registry.maybe_gc(&run.execution_id).await;
        });
    }

    /// Apply a controller operation to a run.
    pub async fn apply_control(&self, run: &Arc<Run>, control: ControlFrame, by: u64) {
        match control.op.as_str() {
            "preempt" => {
                let state = run.state();
                if state.is_terminal() {
                    let mut fields = BTreeMap::new();
                    fields.insert("noop".into(), serde_json::json!(true));
                    run.emit(Run::phase_event("preempted", by, fields)).await;
                    return;
                }
                run.transition(RunState::Preempted);
                run.cancel.cancel();
                run.emit(Run::phase_event("preempted", by, BTreeMap::new()))
                    .await;
                // Give the worker its grace, then escalate to signals.
                if let Some(control_handle) = self.worker_control_of(run).await {
                    let grace = self.config.grace;
                    tokio::spawn(async move {
                        escalate(control_handle, grace).await;
                    });
                }
            }
            "pause" => {
                if !run.state().is_terminal() {
                    run.transition(RunState::Paused);
                }
                run.emit(Run::phase_event("paused", by, BTreeMap::new()))
                    .await;
            }
            "resume" => {
                if !run.state().is_terminal() {
                    run.transition(RunState::Running);
                }
                run.emit(Run::phase_event("resumed", by, BTreeMap::new()))
                    .await;
            }
            "set_budget" => {
                let budgets = run.set_budgets(control.tokens, control.time_s);
                let mut fields = BTreeMap::new();
                fields.insert("budgets".into(), serde_json::to_value(budgets).unwrap_or_default());
                run.emit(Run::phase_event("budget_updated", by, fields)).await;
            }
            other => {
                let mut fields = BTreeMap::new();
                fields.insert("noop".into(), serde_json::json!(true));
                fields.insert("op".into(), serde_json::json!(other));
                run.emit(Run::phase_event("control_noop", by, fields)).await;
            }
        }
    }

    /// Drop the run when it is terminal and unobserved: enqueue the fanout
    /// sentinel, await the fanout task bounded, remove from the map.
    pub async fn maybe_gc(&self, execution_id: &str) {
        let run = {
            let runs = self.runs.lock().await;
            match runs.get(execution_id) {
                Some(run) => run.clone(),
                None => return,
            }
        };
        if !run.state().is_terminal() || !run.has_no_subscribers() {
            return;
        }
        run.shutdown_fanout().await;
        self.runs.lock().await.remove(execution_id);
        info!(execution_id = %execution_id, "run collected");
    }

    /// The live worker control for a run, when one is attached.
    async fn worker_control_of(
        &self,
        run: &Arc<Run>,
    ) -> Option<Arc<dyn crate::worker::WorkerControl>> {
        run.worker_control()
    }
}
