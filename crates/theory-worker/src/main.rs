// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Worker binary.
//!
//! Protocol with the supervisor: one JSON payload line on stdin, JSONL
//! `theory.run.v1` frames on stdout, and `{"kind":"control",...}` lines
//! back on stdin for cooperative cancellation. SIGTERM also cancels.

use theory_core::cancel::CancelFlag;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use theory_core::frame::WsFrame;
use theory_worker::tools::builtin;
use theory_worker::{RunnerEnv, WorkerPayload, run_tool};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    theory_telemetry::init_from_env();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let first = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("no payload on stdin"))?;
    let payload: WorkerPayload = serde_json::from_str(&first)
        .map_err(|e| anyhow::anyhow!("payload did not parse: {e}"))?;
    let execution_id = payload.execution_id.clone();

    let cancel = CancelFlag::new();

    // Cancellation arrives as control lines on stdin or as SIGTERM.
    let stdin_cancel = cancel.clone();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(WsFrame::Control(control)) = serde_json::from_str::<WsFrame>(&line)
                && control.op == "preempt"
            {
                debug!("cancel requested over stdin");
                stdin_cancel.cancel();
            }
        }
    });
    let term_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Ok(mut term) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            term.recv().await;
            debug!("cancel requested via SIGTERM");
            term_cancel.cancel();
        }
    });

    // Frames flow through a channel so tool code never touches stdout.
    let (tx, mut rx) = mpsc::channel::<WsFrame>(2048);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            if let Ok(mut line) = serde_json::to_vec(&frame) {
                line.push(b'\n');
                if stdout.write_all(&line).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        }
    });

    let tool_ref =
        std::env::var("THEORY_TOOL").unwrap_or_else(|_| "llm/litellm@1".to_string());
    let env = RunnerEnv::from_env();

    // The tool runs on its own task so a panic becomes an error envelope
    // instead of escaping the worker boundary.
    let run_tx = tx.clone();
    let envelope = match builtin(&tool_ref) {
        Some(tool) => {
            let handle = tokio::spawn(async move {
                run_tool(tool.as_ref(), payload, &env, run_tx, cancel).await
            });
            match handle.await {
                Ok(envelope) => envelope,
                Err(join_err) => ExecutionEnvelope::error(
                    &execution_id,
                    ErrorCode::ErrRuntime,
                    format!("tool panicked: {join_err}"),
                ),
            }
        }
        None => ExecutionEnvelope::error(
            &execution_id,
            ErrorCode::ErrInputs,
            format!("no built-in tool for {tool_ref}"),
        ),
    };

    tx.send(WsFrame::RunResult(envelope)).await.ok();
    drop(tx);
    writer.await.ok();
    Ok(())
}
