// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI configuration, resolved from the environment.

use std::path::PathBuf;

/// Everything the CLI needs to wire an orchestrator and its adapters.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Root of the on-disk tool catalog.
    pub registry_dir: PathBuf,
    /// Object-store endpoint the presigner signs for.
    pub store_endpoint: String,
    /// Presigner signing secret.
    pub store_secret: String,
    /// Bucket artifacts land in.
    pub bucket: String,
    /// World id inputs may reference.
    pub world: String,
    /// State directory (port map and friends).
    pub state_dir: PathBuf,
    /// Directory bind-mounted at `/world` in local containers.
    pub world_dir: PathBuf,
}

impl CliConfig {
    /// Resolve from environment variables with local-dev defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let state_dir = std::env::var("THEORY_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cwd.join(".theory"));
        Self {
            registry_dir: std::env::var("THEORY_REGISTRY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| cwd.join("registry")),
            store_endpoint: std::env::var("THEORY_STORE_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".into()),
            store_secret: std::env::var("THEORY_STORE_SECRET")
                .unwrap_or_else(|_| "theory-dev".into()),
            bucket: std::env::var("THEORY_BUCKET").unwrap_or_else(|_| "outputs".into()),
            world: std::env::var("THEORY_WORLD").unwrap_or_else(|_| "outputs".into()),
            world_dir: std::env::var("THEORY_WORLD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| cwd),
            state_dir,
        }
    }

    /// Path of the port-map state file.
    #[must_use]
    pub fn port_state_path(&self) -> PathBuf {
        self.state_dir.join("local_ports.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CliConfig::from_env();
        assert!(!config.bucket.is_empty());
        assert!(config.port_state_path().ends_with("local_ports.json"));
    }
}
