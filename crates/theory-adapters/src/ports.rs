// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host-port allocation for local tool containers.
//!
//! A single JSON file maps `ref → port` so restarts reuse the same port.
//! Writes are small whole-file rewrites; a torn or corrupt read degrades
//! to an empty map.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use theory_core::ToolRef;
use tracing::debug;

/// First port probed when no recorded port is usable.
pub const PORT_SCAN_BASE: u16 = 40000;

/// The on-disk `{ref: port}` map.
#[derive(Debug, Clone)]
pub struct PortMap {
    path: PathBuf,
}

impl PortMap {
    /// Port map backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, u16> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, state: &BTreeMap<String, u16>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".into());
        std::fs::write(&self.path, raw)
    }

    /// Recorded port for `tool_ref`, if any.
    #[must_use]
    pub fn recorded(&self, tool_ref: &ToolRef) -> Option<u16> {
        self.load().get(&tool_ref.to_string()).copied()
    }

    /// Allocate a host port for `tool_ref`.
    ///
    /// An explicit `override_port` is recorded and used as-is. Otherwise
    /// the recorded port is reused when still free, else the scan starts
    /// at [`PORT_SCAN_BASE`] skipping recorded and bound ports.
    ///
    /// # Errors
    ///
    /// Returns an error when the state file cannot be written.
    pub fn allocate(
        &self,
        tool_ref: &ToolRef,
        override_port: Option<u16>,
    ) -> std::io::Result<u16> {
        let key = tool_ref.to_string();
        let mut state = self.load();

        if let Some(port) = override_port {
            state.insert(key, port);
            self.save(&state)?;
            return Ok(port);
        }

        if let Some(&port) = state.get(&key) {
            return Ok(port);
        }

        let taken: std::collections::BTreeSet<u16> = state.values().copied().collect();
        let mut port = PORT_SCAN_BASE;
        while taken.contains(&port) || port_in_use(port) {
            port += 1;
        }
        debug!(tool_ref = %tool_ref, port, "allocated host port");
        state.insert(key, port);
        self.save(&state)?;
        Ok(port)
    }

    /// Drop the record for `tool_ref`. Called on `stop`.
    ///
    /// # Errors
    ///
    /// Returns an error when the state file cannot be written.
    pub fn purge(&self, tool_ref: &ToolRef) -> std::io::Result<()> {
        let mut state = self.load();
        if state.remove(&tool_ref.to_string()).is_some() {
            self.save(&state)?;
        }
        Ok(())
    }

    /// Drop every record. Called on `stop --all`.
    ///
    /// # Errors
    ///
    /// Returns an error when the state file cannot be written.
    pub fn purge_all(&self) -> std::io::Result<()> {
        self.save(&BTreeMap::new())
    }
}

fn port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}
