// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-adapters
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Local Docker lane.
pub mod local;
/// Host-port allocation state.
pub mod ports;
/// Remote serverless lane.
pub mod remote;
/// Shared WebSocket client transport.
pub mod transport;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use theory_core::ToolRef;

pub use transport::{EventStream, InvokeOutcome};

/// Everything an adapter needs to run one execution.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Tool being executed.
    pub tool_ref: ToolRef,
    /// Execution id bound to the run.
    pub execution_id: String,
    /// Full worker payload, forwarded verbatim inside `RunOpen`.
    pub payload: Value,
    /// Overall run deadline.
    pub timeout: Duration,
    /// `true` to receive the event stream, `false` for the envelope only.
    pub stream: bool,
    /// Lane-specific resolution produced by the orchestrator.
    pub hints: LaneHints,
}

/// Lane resolution: which image to run and what to inject.
#[derive(Debug, Clone, Default)]
pub struct LaneHints {
    /// Image reference for the local lane (built tag or pinned ref).
    pub image_ref: Option<String>,
    /// Digest expected by the digest guard, when pinned.
    pub expected_digest: Option<String>,
    /// Environment to inject into the container (secrets, determinism).
    pub env: BTreeMap<String, String>,
}

/// One execution lane.
///
/// Both lanes share the same operation: resolve an endpoint, dial the
/// WebSocket, stream the run. The local lane additionally manages the
/// container behind that endpoint.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Run one execution. Failures are returned as synthetic error
    /// envelopes inside the outcome, never as panics or errors.
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome;

    /// Lane name for logs and receipts (`local`, `remote`, …).
    fn name(&self) -> &'static str;
}

/// An adapter that dials one known endpoint and manages nothing.
///
/// Used by tests and by deployments that port-forward a supervisor.
#[derive(Debug, Clone)]
pub struct FixedEndpointAdapter {
    ws_url: String,
}

impl FixedEndpointAdapter {
    /// Adapter dialing `ws_url` (should already end in `/run`).
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl Adapter for FixedEndpointAdapter {
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        transport::invoke_ws(
            &self.ws_url,
            &request.execution_id,
            request.payload,
            request.timeout,
            request.stream,
        )
        .await
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
