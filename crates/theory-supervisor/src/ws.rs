// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `/run` WebSocket endpoint and `/healthz`.
//!
//! Handshake: the client must offer the `theory.run.v1` subprotocol or the
//! upgrade is refused at the HTTP layer. After accept, the first frame must
//! be `RunOpen`; a malformed opening frame closes with 1002, missing
//! required fields close with 1008.

use crate::registry::RunRegistry;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use theory_core::frame::{Role, RunOpen, WsFrame};
use theory_core::{HEALTHZ_PATH, RUN_PATH, RUN_SUBPROTOCOL};
use tracing::{debug, warn};

/// Close code: protocol error (bad first frame, wrong kind).
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code: policy violation (missing required fields, bad role).
const CLOSE_POLICY: u16 = 1008;
/// How long the supervisor waits for the opening frame.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the supervisor router: `GET /run` (WebSocket) and `GET /healthz`.
pub fn build_router(registry: Arc<RunRegistry>) -> Router {
    Router::new()
        .route(RUN_PATH, get(run_ws))
        .route(HEALTHZ_PATH, get(healthz))
        .with_state(registry)
}

/// Serve on an ephemeral local port; returns the bound address.
///
/// # Errors
///
/// Returns the bind error when the listener cannot be created.
pub async fn serve_ephemeral(registry: Arc<RunRegistry>) -> std::io::Result<SocketAddr> {
    let app = build_router(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

/// `GET /healthz`. Answers within the SLA with no side effects, no auth.
async fn healthz(State(registry): State<Arc<RunRegistry>>) -> Json<serde_json::Value> {
    Json(json!({"ok": true, "digest": registry.config.image_digest}))
}

/// `GET /run`. Gates the subprotocol at the HTTP layer, then upgrades.
async fn run_ws(
    State(registry): State<Arc<RunRegistry>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !offered
        .split(',')
        .any(|p| p.trim() == RUN_SUBPROTOCOL)
    {
        return (
            StatusCode::BAD_REQUEST,
            format!("subprotocol {RUN_SUBPROTOCOL} is required"),
        )
            .into_response();
    }
    ws.protocols([RUN_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(registry, socket))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(registry: Arc<RunRegistry>, mut socket: WebSocket) {
    // The opening frame must arrive promptly and must be RunOpen.
    let first = tokio::time::timeout(OPEN_TIMEOUT, socket.recv()).await;
    let open: RunOpen = match first {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<WsFrame>(&text) {
            Ok(WsFrame::RunOpen(open)) => open,
            Ok(_) | Err(_) => {
                close_with(socket, CLOSE_PROTOCOL_ERROR, "first frame must be RunOpen").await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            close_with(socket, CLOSE_PROTOCOL_ERROR, "expected a text frame").await;
            return;
        }
        _ => return,
    };

    let execution_id = open.execution_id.trim().to_string();
    if execution_id.is_empty() {
        close_with(socket, CLOSE_POLICY, "execution_id is required").await;
        return;
    }
    let role = open.role;

    let run = registry.get_or_create(&execution_id).await;
    let conn_id = registry.next_conn_id();
    let mut outgoing = run.add_subscriber(conn_id, role);

    if socket
        .send(Message::Text(
            serde_json::to_string(&WsFrame::Ack {
                execution_id: execution_id.clone(),
            })
            .unwrap_or_default()
            .into(),
        ))
        .await
        .is_err()
    {
        run.remove_subscriber(conn_id);
        registry.maybe_gc(&execution_id).await;
        return;
    }

    // A client joining a pending run starts the worker.
    if role == Role::Client {
        let mut payload = open.payload.unwrap_or_else(|| json!({}));
        if payload.get("execution_id").is_none()
            && let Some(map) = payload.as_object_mut()
        {
            map.insert("execution_id".into(), json!(execution_id.clone()));
        }
        registry.start_run(&run, payload).await;
    }

    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(execution_id = %execution_id, error = %err, "unserializable frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = incoming.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsFrame>(&text) {
                            Ok(WsFrame::Control(control)) if role == Role::Controller => {
                                registry.apply_control(&run, control, conn_id).await;
                            }
                            Ok(WsFrame::Control(_)) => {
                                debug!(execution_id = %execution_id, conn = conn_id, role = %role,
                                    "control frame from non-controller ignored");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!(execution_id = %execution_id, error = %err, "unparseable client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    run.remove_subscriber(conn_id);
    registry.maybe_gc(&execution_id).await;
}
