// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-oriented compact output.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` controls filtering (default `info`). Safe to call more than
/// once; later calls are no-ops.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = match format {
        LogFormat::Pretty => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // An already-set subscriber is fine (tests, embedding).
    let _ = result;
}

/// Initialise with an explicit filter, ignoring `RUST_LOG`.
pub fn init_with_filter(format: LogFormat, filter: &str) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false);
    let result = match format {
        LogFormat::Pretty => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    let _ = result;
}

/// Initialise from the environment: `THEORY_LOG_FORMAT=json` selects JSON.
pub fn init_from_env() {
    let format = match std::env::var("THEORY_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init(format);
}

/// Counters captured for a single execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Tool ref executed.
    pub tool_ref: String,
    /// Adapter lane (`local` / `remote`).
    pub adapter: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Events observed on the stream.
    pub events_count: u64,
    /// Token frames observed.
    pub tokens_count: u64,
    /// Whether the run settled with an error envelope.
    pub errored: bool,
}

/// Thread-safe collector of run counters.
#[derive(Debug, Clone, Default)]
pub struct RunCollector {
    inner: Arc<Mutex<Vec<RunCounters>>>,
}

impl RunCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished run.
    pub fn record(&self, counters: RunCounters) {
        self.inner
            .lock()
            .expect("run collector lock poisoned")
            .push(counters);
    }

    /// Snapshot of all recorded runs.
    #[must_use]
    pub fn runs(&self) -> Vec<RunCounters> {
        self.inner
            .lock()
            .expect("run collector lock poisoned")
            .clone()
    }

    /// Error rate across recorded runs, 0.0 when empty.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let runs = self.runs();
        if runs.is_empty() {
            return 0.0;
        }
        runs.iter().filter(|r| r.errored).count() as f64 / runs.len() as f64
    }
}
