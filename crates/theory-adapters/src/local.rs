// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local Docker lane.
//!
//! Owns container lifecycle keyed by tool ref: a stable name, the
//! `com.theory.ref` label, a published host port from the port map, the
//! `/world` bind mount, and injected env (digest, secrets, determinism).
//! A bounded health gate runs before any WebSocket is dialed; on failure
//! the container is stopped and the stderr tail is attached to the error.

use crate::ports::PortMap;
use crate::transport;
use crate::{Adapter, InvokeOutcome, InvokeRequest};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use theory_core::ToolRef;
use theory_core::digest::normalize_digest;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use tokio::process::Command;
use tracing::{debug, info};

/// Label every managed container carries.
pub const REF_LABEL: &str = "com.theory.ref";
/// Container name prefix (`theory-proc-<slug>-<hash8>`).
pub const NAME_PREFIX: &str = "theory-proc-";
/// Image repository prefix of locally built tools.
pub const LOCAL_IMAGE_PREFIX: &str = "theory-local/";

/// Health-gate budget.
const HEALTH_BUDGET: Duration = Duration::from_secs(15);
/// Health poll backoff: base, multiplier, cap.
const HEALTH_BASE: Duration = Duration::from_millis(100);
const HEALTH_FACTOR: f64 = 1.6;
const HEALTH_CAP: Duration = Duration::from_millis(1500);
/// Stop budget before the engine force-kills.
const STOP_TIMEOUT_S: u32 = 10;
/// How much stderr to attach to a health failure.
const STDERR_TAIL_BYTES: usize = 2048;

/// Env keys that are logged verbatim; everything else redacts to `***`.
const STANDARD_ENV_KEYS: [&str; 6] = [
    "TZ",
    "LC_ALL",
    "IMAGE_DIGEST",
    "HOME",
    "XDG_CACHE_HOME",
    "HF_HOME",
];

/// One managed container as reported by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    /// Engine container id.
    pub container_id: String,
    /// Container name.
    pub name: String,
    /// Engine status string.
    pub status: String,
    /// Published host port, when parseable.
    pub port: Option<u16>,
    /// Value of the ref label, when present.
    pub tool_ref: String,
}

impl ContainerInfo {
    /// Whether the engine reports the container as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.starts_with("Up")
    }
}

/// Errors from local container management.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    /// The container engine invocation failed.
    #[error("container engine failed: {0}")]
    Engine(String),
    /// The health gate timed out; stderr tail attached.
    #[error("health gate timed out on port {port}; stderr tail:\n{stderr_tail}")]
    Health {
        /// Host port that never became healthy.
        port: u16,
        /// Last bytes of container stderr.
        stderr_tail: String,
    },
    /// State-file I/O failed.
    #[error("port state error: {0}")]
    PortState(#[from] std::io::Error),
}

/// The local Docker adapter.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    /// Directory bind-mounted into the container at `/world`.
    pub world_dir: PathBuf,
    ports: PortMap,
    engine: String,
}

/// Result of a `start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    /// Container name.
    pub name: String,
    /// Published host port.
    pub port: u16,
    /// `true` when an already-running container was reused.
    pub reused: bool,
}

impl LocalAdapter {
    /// Adapter with its port state at `state_path` and `world_dir`
    /// mounted into containers.
    pub fn new(state_path: impl Into<PathBuf>, world_dir: impl Into<PathBuf>) -> Self {
        Self {
            world_dir: world_dir.into(),
            ports: PortMap::new(state_path),
            engine: std::env::var("THEORY_CONTAINER_ENGINE").unwrap_or_else(|_| "docker".into()),
        }
    }

    /// Stable container name: slugged ref plus an 8-hex hash of the image
    /// reference, so image changes get fresh containers.
    #[must_use]
    pub fn container_name(tool_ref: &ToolRef, image_ref: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_ref.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        format!("{NAME_PREFIX}{}-{}", tool_ref.slug(), &hash[..8])
    }

    /// `IMAGE_DIGEST` resolution order: caller-declared expected digest,
    /// digest embedded in the image reference, engine image id, `unknown`.
    pub async fn resolve_image_digest(
        &self,
        image_ref: &str,
        expected_digest: Option<&str>,
    ) -> String {
        if let Some(digest) = expected_digest.and_then(normalize_digest) {
            return digest;
        }
        if let Some(digest) = normalize_digest(image_ref) {
            return digest;
        }
        if let Ok(output) = self
            .engine_cmd(&["image", "inspect", "--format", "{{.Id}}", image_ref])
            .await
        {
            let id = output.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
        "unknown".into()
    }

    /// Start (or reuse) the container for `tool_ref` and gate on health.
    ///
    /// # Errors
    ///
    /// [`LocalError::Health`] when the gate times out (container stopped),
    /// [`LocalError::Engine`] when the engine refuses the run.
    pub async fn start(
        &self,
        tool_ref: &ToolRef,
        image_ref: &str,
        env: &BTreeMap<String, String>,
        port_override: Option<u16>,
    ) -> Result<StartResult, LocalError> {
        // Reuse a running container when one matches the ref label.
        let existing = self.find_by_ref(tool_ref).await?;
        if let Some(container) = existing.iter().find(|c| c.is_running())
            && let Some(port) = container.port
        {
            debug!(tool_ref = %tool_ref, port, "reusing running container");
            self.health_gate(port).await?;
            return Ok(StartResult {
                name: container.name.clone(),
                port,
                reused: true,
            });
        }

        let port = self.ports.allocate(tool_ref, port_override)?;
        let name = Self::container_name(tool_ref, image_ref);

        // A stopped container may still hold the name.
        let _ = self.engine_cmd(&["rm", "-f", &name]).await;

        let uid = nix::unistd::Uid::effective().as_raw();
        let gid = nix::unistd::Gid::effective().as_raw();
        let world = self.world_dir.display().to_string();

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.clone(),
            "--label".into(),
            format!("{REF_LABEL}={tool_ref}"),
            "--user".into(),
            format!("{uid}:{gid}"),
            "-p".into(),
            format!("{port}:8000"),
            "-v".into(),
            format!("{world}:/world"),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(image_ref.to_string());

        info!(tool_ref = %tool_ref, cmd = %redact_command(&self.engine, &args), "starting container");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.engine_cmd(&arg_refs).await?;

        match self.health_gate(port).await {
            Ok(()) => Ok(StartResult {
                name,
                port,
                reused: false,
            }),
            Err(err) => {
                // Tear down and surface the tail.
                let _ = self.engine_cmd(&["rm", "-f", &name]).await;
                Err(err)
            }
        }
    }

    /// Poll `/healthz` with exponential backoff until `{ok:true}` or the
    /// budget runs out.
    async fn health_gate(&self, port: u16) -> Result<(), LocalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(1500))
            .build()
            .map_err(|e| LocalError::Engine(e.to_string()))?;
        let url = format!("http://127.0.0.1:{port}/healthz");
        let deadline = Instant::now() + HEALTH_BUDGET;
        let mut delay = HEALTH_BASE;
        loop {
            if let Ok(resp) = client.get(&url).send().await
                && resp.status().is_success()
                && let Ok(body) = resp.json::<serde_json::Value>().await
                && body["ok"] == serde_json::Value::Bool(true)
            {
                return Ok(());
            }
            if Instant::now() + delay > deadline {
                let stderr_tail = self.stderr_tail_for_port(port).await;
                return Err(LocalError::Health { port, stderr_tail });
            }
            tokio::time::sleep(delay).await;
            delay = Duration::from_millis(
                ((delay.as_millis() as f64) * HEALTH_FACTOR).min(HEALTH_CAP.as_millis() as f64)
                    as u64,
            );
        }
    }

    async fn stderr_tail_for_port(&self, port: u16) -> String {
        let containers = self.find_all().await.unwrap_or_default();
        let Some(container) = containers.iter().find(|c| c.port == Some(port)) else {
            return String::new();
        };
        match self
            .engine_cmd(&["logs", "--tail", "50", &container.container_id])
            .await
        {
            Ok(logs) => {
                let tail_start = logs.len().saturating_sub(STDERR_TAIL_BYTES);
                logs[tail_start..].to_string()
            }
            Err(_) => String::new(),
        }
    }

    /// Containers labeled with `tool_ref`.
    ///
    /// # Errors
    ///
    /// [`LocalError::Engine`] when the engine call fails.
    pub async fn find_by_ref(&self, tool_ref: &ToolRef) -> Result<Vec<ContainerInfo>, LocalError> {
        self.ps(&["--filter", &format!("label={REF_LABEL}={tool_ref}")])
            .await
    }

    /// Every managed container: by label, by name pattern, and by image
    /// ancestry, deduplicated by container id.
    ///
    /// # Errors
    ///
    /// [`LocalError::Engine`] when the engine call fails.
    pub async fn find_all(&self) -> Result<Vec<ContainerInfo>, LocalError> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        let batches = [
            self.ps(&["--filter", &format!("label={REF_LABEL}")]).await?,
            self.ps(&["--filter", &format!("name={NAME_PREFIX}")]).await?,
        ];
        for batch in batches {
            for container in batch {
                if seen.insert(container.container_id.clone()) {
                    out.push(container);
                }
            }
        }
        // Orphans launched from local images without labels or names.
        if let Ok(images) = self.engine_cmd(&["ps", "-a", "--format", "{{.Image}}"]).await {
            let locals: std::collections::BTreeSet<&str> = images
                .lines()
                .filter(|image| image.starts_with(LOCAL_IMAGE_PREFIX))
                .collect();
            for image in locals {
                for container in self.ps(&["--filter", &format!("ancestor={image}")]).await? {
                    if seen.insert(container.container_id.clone()) {
                        out.push(container);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Force-remove containers for `tool_ref` (or every managed container
    /// with `all`) and purge port records.
    ///
    /// # Errors
    ///
    /// [`LocalError::Engine`] when the engine call fails.
    pub async fn stop(
        &self,
        tool_ref: Option<&ToolRef>,
        all: bool,
    ) -> Result<Vec<ContainerInfo>, LocalError> {
        let targets = match (tool_ref, all) {
            (Some(tool_ref), _) => self.find_by_ref(tool_ref).await?,
            (None, true) => self.find_all().await?,
            (None, false) => Vec::new(),
        };
        for container in &targets {
            let _ = self
                .engine_cmd(&["stop", "-t", &STOP_TIMEOUT_S.to_string(), &container.container_id])
                .await;
            let _ = self.engine_cmd(&["rm", "-f", &container.container_id]).await;
        }
        if let Some(tool_ref) = tool_ref {
            self.ports.purge(tool_ref)?;
        } else if all {
            self.ports.purge_all()?;
        }
        Ok(targets)
    }

    /// Engine logs for the ref's container.
    ///
    /// # Errors
    ///
    /// [`LocalError::Engine`] when no container exists or the call fails.
    pub async fn logs(&self, tool_ref: &ToolRef, tail: u32) -> Result<String, LocalError> {
        let containers = self.find_by_ref(tool_ref).await?;
        let Some(container) = containers.first() else {
            return Err(LocalError::Engine(format!("no container for {tool_ref}")));
        };
        self.engine_cmd(&["logs", "--tail", &tail.to_string(), &container.container_id])
            .await
    }

    /// Follow engine logs for the ref's container, inheriting stdio until
    /// interrupted.
    ///
    /// # Errors
    ///
    /// [`LocalError::Engine`] when no container exists or the call fails.
    pub async fn logs_follow(&self, tool_ref: &ToolRef, tail: u32) -> Result<(), LocalError> {
        let containers = self.find_by_ref(tool_ref).await?;
        let Some(container) = containers.first() else {
            return Err(LocalError::Engine(format!("no container for {tool_ref}")));
        };
        let status = Command::new(&self.engine)
            .args(["logs", "-f", "--tail", &tail.to_string(), &container.container_id])
            .status()
            .await
            .map_err(|e| LocalError::Engine(format!("{} not runnable: {e}", self.engine)))?;
        if !status.success() {
            return Err(LocalError::Engine("log follow exited with failure".into()));
        }
        Ok(())
    }

    /// Recorded host port for the ref, when one exists.
    #[must_use]
    pub fn recorded_port(&self, tool_ref: &ToolRef) -> Option<u16> {
        self.ports.recorded(tool_ref)
    }

    async fn ps(&self, filters: &[&str]) -> Result<Vec<ContainerInfo>, LocalError> {
        let mut args = vec!["ps", "-a"];
        args.extend_from_slice(filters);
        args.extend_from_slice(&[
            "--format",
            "{{.ID}}|{{.Names}}|{{.Status}}|{{.Ports}}|{{.Label \"com.theory.ref\"}}",
        ]);
        let output = self.engine_cmd(&args).await?;
        Ok(output.lines().filter_map(parse_ps_line).collect())
    }

    async fn engine_cmd(&self, args: &[&str]) -> Result<String, LocalError> {
        let output = Command::new(&self.engine)
            .args(args)
            .output()
            .await
            .map_err(|e| LocalError::Engine(format!("{} not runnable: {e}", self.engine)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LocalError::Engine(format!(
                "{} {} failed: {}",
                self.engine,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        let Some(image_ref) = request.hints.image_ref.clone() else {
            return InvokeOutcome::Final(ExecutionEnvelope::error(
                &request.execution_id,
                ErrorCode::ErrInputs,
                "local lane requires an image reference",
            ));
        };

        // Compose the injected env: digest first, then caller env
        // (secrets), then determinism defaults.
        let mut env = request.hints.env.clone();
        let digest = self
            .resolve_image_digest(&image_ref, request.hints.expected_digest.as_deref())
            .await;
        env.insert("IMAGE_DIGEST".into(), digest);
        env.entry("TZ".into()).or_insert_with(|| "UTC".into());
        env.entry("LC_ALL".into()).or_insert_with(|| "C.UTF-8".into());

        let started = self.start(&request.tool_ref, &image_ref, &env, None).await;
        let port = match started {
            Ok(result) => result.port,
            Err(LocalError::Health { port, stderr_tail }) => {
                return InvokeOutcome::Final(ExecutionEnvelope::error(
                    &request.execution_id,
                    ErrorCode::ErrHealth,
                    format!("tool never became healthy on port {port}: {stderr_tail}"),
                ));
            }
            Err(err) => {
                return InvokeOutcome::Final(ExecutionEnvelope::error(
                    &request.execution_id,
                    ErrorCode::ErrNetwork,
                    err.to_string(),
                ));
            }
        };

        let ws_url = format!("ws://127.0.0.1:{port}/run");
        transport::invoke_ws(
            &ws_url,
            &request.execution_id,
            request.payload,
            request.timeout,
            request.stream,
        )
        .await
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Parse one `docker ps --format` line.
fn parse_ps_line(line: &str) -> Option<ContainerInfo> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 4 || parts[0].is_empty() {
        return None;
    }
    Some(ContainerInfo {
        container_id: parts[0].to_string(),
        name: parts[1].to_string(),
        status: parts[2].to_string(),
        port: extract_host_port(parts[3]),
        tool_ref: parts.get(4).copied().unwrap_or_default().to_string(),
    })
}

/// `"0.0.0.0:40000->8000/tcp, …"` → `40000`.
fn extract_host_port(ports: &str) -> Option<u16> {
    let (head, _) = ports.split_once("->")?;
    head.rsplit_once(':')?.1.parse().ok()
}

/// Render a start command with every non-standard env value replaced by
/// `***`. Secrets never reach the logs.
#[must_use]
pub fn redact_command(engine: &str, args: &[String]) -> String {
    let mut out = vec![engine.to_string()];
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-e" && i + 1 < args.len() {
            let (key, _) = args[i + 1].split_once('=').unwrap_or((&args[i + 1], ""));
            if STANDARD_ENV_KEYS.contains(&key) {
                out.push("-e".into());
                out.push(args[i + 1].clone());
            } else {
                out.push("-e".into());
                out.push(format!("{key}=***"));
            }
            i += 2;
        } else {
            out.push(args[i].clone());
            i += 1;
        }
    }
    out.join(" ")
}
