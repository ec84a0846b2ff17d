// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire frames for the `theory.run.v1` WebSocket protocol.
//!
//! Every frame is a JSON text message of shape `{"kind": …, "content": …}`.
//! The first client frame must be [`WsFrame::RunOpen`]; the supervisor
//! replies with [`WsFrame::Ack`] and thereafter fans out any number of
//! `Token`/`Frame`/`Log`/`Event` frames followed by exactly one
//! [`WsFrame::RunResult`].

use crate::envelope::ExecutionEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Role a WebSocket connection binds to a run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Initiates work. Exactly one per run is expected.
    Client,
    /// May send control frames.
    Controller,
    /// Read-only observer of fanned-out events.
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Controller => "controller",
            Self::Observer => "observer",
        })
    }
}

/// Opening frame content: binds the connection to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOpen {
    /// Role this connection takes. Defaults to client when omitted.
    #[serde(default = "default_role")]
    pub role: Role,
    /// Execution id the connection binds to.
    ///
    /// `run_id` is accepted as a legacy alias. Defaults to empty when the
    /// key is absent so the server can distinguish a malformed frame
    /// (protocol error) from a missing required field (policy error).
    #[serde(default, alias = "run_id")]
    pub execution_id: String,
    /// Work payload, present on client opens that should start the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

fn default_role() -> Role {
    Role::Client
}

/// Control frame content sent by controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Operation name: `preempt`, `pause`, `resume`, `set_budget`, or
    /// anything else (acknowledged as a no-op).
    pub op: String,
    /// Optional token budget for `set_budget`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Optional wall-time budget (seconds) for `set_budget`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_s: Option<u64>,
}

/// A single `theory.run.v1` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content")]
pub enum WsFrame {
    /// First client frame; binds the connection to a run.
    RunOpen(RunOpen),
    /// Supervisor acknowledgement of a successful bind.
    Ack {
        /// The bound execution id.
        execution_id: String,
    },
    /// Incremental text fragment. Droppable under backpressure.
    Token {
        /// The text fragment.
        text: String,
    },
    /// An artifact was written.
    Frame {
        /// World path of the artifact.
        path: String,
        /// MIME type, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    /// Human-oriented structured log line.
    Log {
        /// Log message.
        msg: String,
        /// Extra structured fields.
        #[serde(default, flatten)]
        fields: BTreeMap<String, Value>,
    },
    /// Lifecycle marker (`started`, `paused`, `preempted`, …).
    Event {
        /// Phase name.
        phase: String,
        /// Extra structured fields (`noop`, `budgets`, `by`, …).
        #[serde(default, flatten)]
        fields: BTreeMap<String, Value>,
    },
    /// Terminal envelope. Exactly one per run; always the last frame.
    RunResult(ExecutionEnvelope),
    /// Controller operation.
    #[serde(rename = "control")]
    Control(ControlFrame),
}

impl WsFrame {
    /// Returns `true` for the terminal frame.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunResult(_))
    }

    /// Returns `true` for frames that may be dropped when the fanout queue
    /// is full. Only fine-grained `Token` frames are droppable.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Token { .. })
    }

    /// Build a lifecycle event frame with no extra fields.
    #[must_use]
    pub fn phase(phase: impl Into<String>) -> Self {
        Self::Event {
            phase: phase.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Build a lifecycle event frame with extra fields.
    #[must_use]
    pub fn phase_with(phase: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self::Event {
            phase: phase.into(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ExecutionEnvelope;
    use serde_json::json;

    #[test]
    fn run_open_wire_shape() {
        let f = WsFrame::RunOpen(RunOpen {
            role: Role::Client,
            execution_id: "e-1".into(),
            payload: Some(json!({"mode": "mock"})),
        });
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["kind"], "RunOpen");
        assert_eq!(v["content"]["role"], "client");
        assert_eq!(v["content"]["execution_id"], "e-1");
    }

    #[test]
    fn run_open_accepts_run_id_alias() {
        let f: WsFrame = serde_json::from_value(json!({
            "kind": "RunOpen",
            "content": {"run_id": "e-2"}
        }))
        .unwrap();
        match f {
            WsFrame::RunOpen(open) => {
                assert_eq!(open.execution_id, "e-2");
                assert_eq!(open.role, Role::Client);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn run_open_without_execution_id_parses_empty() {
        // The frame itself is well-formed; enforcing the required field
        // is the server's job (policy close, not protocol close).
        let f: WsFrame = serde_json::from_value(json!({
            "kind": "RunOpen",
            "content": {"role": "observer"}
        }))
        .unwrap();
        match f {
            WsFrame::RunOpen(open) => {
                assert!(open.execution_id.is_empty());
                assert_eq!(open.role, Role::Observer);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn control_frame_wire_shape() {
        let f: WsFrame = serde_json::from_value(json!({
            "kind": "control",
            "content": {"op": "set_budget", "tokens": 1000}
        }))
        .unwrap();
        match f {
            WsFrame::Control(c) => {
                assert_eq!(c.op, "set_budget");
                assert_eq!(c.tokens, Some(1000));
                assert_eq!(c.time_s, None);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn token_is_droppable_terminal_is_not() {
        let token = WsFrame::Token { text: "hi".into() };
        assert!(token.is_droppable());
        assert!(!token.is_terminal());

        let result = WsFrame::RunResult(ExecutionEnvelope::error(
            "e-1",
            crate::error::ErrorCode::ErrRuntime,
            "boom",
        ));
        assert!(result.is_terminal());
        assert!(!result.is_droppable());
    }

    #[test]
    fn event_flattens_extra_fields() {
        let f = WsFrame::phase_with(
            "control_noop",
            [("noop".to_string(), json!(true))].into_iter().collect(),
        );
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["content"]["phase"], "control_noop");
        assert_eq!(v["content"]["noop"], true);
    }

    #[test]
    fn frame_roundtrip_all_stream_kinds() {
        let frames = vec![
            WsFrame::Token { text: "t".into() },
            WsFrame::Frame {
                path: "/artifacts/x/outputs/a.txt".into(),
                mime: Some("text/plain".into()),
            },
            WsFrame::Log {
                msg: "line".into(),
                fields: BTreeMap::new(),
            },
            WsFrame::phase("started"),
        ];
        for f in frames {
            let s = serde_json::to_string(&f).unwrap();
            let _: WsFrame = serde_json::from_str(&s).unwrap();
        }
    }
}
