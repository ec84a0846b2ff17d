// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared WebSocket client transport.
//!
//! Both lanes end up here: dial with the `theory.run.v1` subprotocol, send
//! `RunOpen`, expect `Ack`, then stream frames until the terminal
//! `RunResult`. Transport and protocol failures are converted to synthetic
//! error envelopes, so callers always observe exactly one terminal result.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use theory_core::frame::{Role, RunOpen, WsFrame};
use theory_core::{MAX_FRAME_BYTES, RUN_SUBPROTOCOL};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, http};
use tracing::{debug, warn};

/// Wait for the `Ack` after `RunOpen`.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-frame wait once the stream is flowing.
const FRAME_TIMEOUT: Duration = Duration::from_secs(15);

/// What an adapter invocation produces.
pub enum InvokeOutcome {
    /// The terminal envelope (non-stream callers).
    Final(ExecutionEnvelope),
    /// Every fanned-out frame, ending with the `RunResult`.
    Stream(EventStream),
}

impl InvokeOutcome {
    /// Drain to the terminal envelope regardless of mode. Streaming
    /// outcomes are consumed; intermediate frames are discarded.
    pub async fn into_final(self) -> ExecutionEnvelope {
        match self {
            Self::Final(envelope) => envelope,
            Self::Stream(mut stream) => {
                let mut last = None;
                while let Some(frame) = stream.next().await {
                    if let WsFrame::RunResult(envelope) = frame {
                        last = Some(envelope);
                    }
                }
                last.unwrap_or_else(|| {
                    ExecutionEnvelope::error(
                        String::new(),
                        ErrorCode::ErrBadResponse,
                        "stream ended without a RunResult",
                    )
                })
            }
        }
    }
}

/// Ordered frames from one run. The `RunResult` is always the last item;
/// the stream then ends.
pub struct EventStream {
    rx: mpsc::Receiver<WsFrame>,
}

impl EventStream {
    /// Wrap a channel whose sender upholds the terminal-last discipline.
    /// Lets callers interpose on a stream (e.g. the digest guard).
    #[must_use]
    pub fn from_channel(rx: mpsc::Receiver<WsFrame>) -> Self {
        Self { rx }
    }

    /// Next frame, or `None` after the terminal.
    pub async fn next(&mut self) -> Option<WsFrame> {
        self.rx.recv().await
    }
}

/// Dial `ws_url`, run the protocol, and return the outcome.
///
/// `timeout` bounds the whole run; the synthetic `ERR_NETWORK` envelope
/// carries the execution id so settlement can proceed.
pub async fn invoke_ws(
    ws_url: &str,
    execution_id: &str,
    payload: Value,
    timeout: Duration,
    stream: bool,
) -> InvokeOutcome {
    let (tx, rx) = mpsc::channel(1024);
    let url = ws_url.to_string();
    let eid = execution_id.to_string();
    tokio::spawn(async move {
        let terminal = drive(&url, &eid, payload, timeout, &tx).await;
        // Exactly one terminal: whatever drive() settled on goes last.
        let _ = tx.send(WsFrame::RunResult(terminal)).await;
    });

    let outcome = InvokeOutcome::Stream(EventStream { rx });
    if stream {
        outcome
    } else {
        InvokeOutcome::Final(outcome.into_final().await)
    }
}

/// Run the socket protocol, forwarding pre-terminal frames into `tx`.
/// Returns the terminal envelope (real or synthetic).
async fn drive(
    ws_url: &str,
    execution_id: &str,
    payload: Value,
    timeout: Duration,
    tx: &mpsc::Sender<WsFrame>,
) -> ExecutionEnvelope {
    let net_err = |message: String| {
        ExecutionEnvelope::error(execution_id, ErrorCode::ErrNetwork, message)
    };

    let mut request = match ws_url.into_client_request() {
        Ok(request) => request,
        Err(err) => return net_err(format!("bad ws url {ws_url:?}: {err}")),
    };
    request.headers_mut().insert(
        "sec-websocket-protocol",
        http::HeaderValue::from_static(RUN_SUBPROTOCOL),
    );

    let config = WebSocketConfig::default().max_message_size(Some(MAX_FRAME_BYTES));
    let connect = tokio_tungstenite::connect_async_with_config(request, Some(config), false);
    let (mut socket, _resp) = match tokio::time::timeout(ACK_TIMEOUT, connect).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => return net_err(format!("connect failed: {err}")),
        Err(_) => return net_err("connect timed out".into()),
    };
    debug!(url = %ws_url, execution_id = %execution_id, "ws connected");

    let open = WsFrame::RunOpen(RunOpen {
        role: Role::Client,
        execution_id: execution_id.to_string(),
        payload: Some(payload),
    });
    let open_text = match serde_json::to_string(&open) {
        Ok(text) => text,
        Err(err) => return net_err(format!("payload serialization failed: {err}")),
    };
    if let Err(err) = socket.send(Message::Text(open_text.into())).await {
        return net_err(format!("RunOpen send failed: {err}"));
    }

    let deadline = Instant::now() + timeout;
    let mut acked = false;
    loop {
        if Instant::now() > deadline {
            return net_err(format!(
                "run exceeded its {}s deadline",
                timeout.as_secs()
            ));
        }
        let wait = if acked { FRAME_TIMEOUT } else { ACK_TIMEOUT };
        let msg = match tokio::time::timeout(wait, socket.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => return net_err(format!("socket error: {err}")),
            Ok(None) => return net_err("socket closed before RunResult".into()),
            Err(_) => {
                let phase = if acked { "frame" } else { "Ack" };
                return net_err(format!("timed out waiting for {phase}"));
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return net_err("socket closed before RunResult".into()),
            _ => continue,
        };
        let frame: WsFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "non-frame message ignored");
                continue;
            }
        };

        match frame {
            WsFrame::Ack { .. } => {
                acked = true;
            }
            WsFrame::RunResult(envelope) => {
                let _ = socket.close(None).await;
                if let Err(invalid) = envelope.validate() {
                    return ExecutionEnvelope::error(
                        execution_id,
                        ErrorCode::ErrBadResponse,
                        format!("invalid envelope: {invalid}"),
                    );
                }
                return envelope;
            }
            other => {
                // Pre-terminal frames flow to the caller in order.
                let _ = tx.send(other).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_yields_err_network() {
        let outcome = invoke_ws(
            "ws://127.0.0.1:1/run",
            "e-net",
            serde_json::json!({}),
            Duration::from_secs(2),
            false,
        )
        .await;
        let envelope = outcome.into_final().await;
        assert_eq!(envelope.error_code(), Some("ERR_NETWORK"));
        assert_eq!(envelope.execution_id, "e-net");
    }
}
