// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-supervisor
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Run registry and control operations.
pub mod registry;
/// One run: state machine, subscribers, fanout.
pub mod run;
/// Worker spawning and process control.
pub mod worker;
/// WebSocket endpoint and health.
pub mod ws;

pub use registry::{RunRegistry, SupervisorConfig};
pub use run::{Run, RunState};
pub use worker::{ProcessWorkerFactory, TaskWorkerFactory, WorkerControl, WorkerFactory};
pub use ws::{build_router, serve_ephemeral};
