// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-registry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use theory_core::ToolRef;
use theory_core::digest::{is_valid_spec_digest, normalize_digest};
use tracing::debug;

/// Container platforms a tool image may be published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// linux/amd64.
    Amd64,
    /// linux/arm64.
    Arm64,
}

impl Platform {
    /// Detect the host platform, defaulting to amd64 for anything exotic.
    #[must_use]
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" | "arm64" => Self::Arm64,
            _ => Self::Amd64,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        })
    }
}

/// Image block of a tool spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Digest-bearing image references keyed by platform
    /// (`repo/name@sha256:…` or the `sha256:pending` placeholder).
    pub platforms: BTreeMap<Platform, String>,
    /// Platform to use when the caller does not pick one.
    pub default_platform: Platform,
}

/// Resource hints for running the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// CPU cores.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in GiB.
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    /// Overall execution timeout in seconds.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// GPU kind, when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

fn default_cpu() -> u32 {
    1
}
fn default_memory_gb() -> u32 {
    2
}
fn default_timeout_s() -> u64 {
    600
}

impl RuntimeSpec {
    /// Environment fingerprint string: `cpu:<n>;memory:<n>Gi[;gpu:<g>]`.
    #[must_use]
    pub fn env_fingerprint(&self) -> String {
        let mut parts = vec![
            format!("cpu:{}", self.cpu),
            format!("memory:{}Gi", self.memory_gb),
        ];
        if let Some(gpu) = &self.gpu {
            parts.push(format!("gpu:{gpu}"));
        }
        parts.join(";")
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            timeout_s: default_timeout_s(),
            gpu: None,
        }
    }
}

/// API block: how to reach the tool inside its container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSpec {
    /// Wire protocol. Only `ws` is supported.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Run endpoint path.
    #[serde(default = "default_run_path")]
    pub path: String,
    /// Health endpoint path.
    #[serde(default = "default_healthz_path")]
    pub healthz: String,
}

fn default_protocol() -> String {
    "ws".into()
}
fn default_run_path() -> String {
    theory_core::RUN_PATH.into()
}
fn default_healthz_path() -> String {
    theory_core::HEALTHZ_PATH.into()
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            path: default_run_path(),
            healthz: default_healthz_path(),
        }
    }
}

/// Secrets block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsSpec {
    /// Environment variable names the tool requires in real mode.
    #[serde(default)]
    pub required: Vec<String>,
}

/// One declared output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Path relative to the run's `outputs/` subtree.
    pub path: String,
    /// MIME hint for the presigned PUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A loaded tool spec. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// The ref this spec describes.
    #[serde(rename = "ref")]
    pub tool_ref: ToolRef,
    /// Image digests per platform.
    pub image: ImageSpec,
    /// Resource hints.
    #[serde(default)]
    pub runtime: RuntimeSpec,
    /// API paths.
    #[serde(default)]
    pub api: ApiSpec,
    /// Required secrets.
    #[serde(default)]
    pub secrets: SecretsSpec,
    /// JSON schema the inputs must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
}

impl ToolSpec {
    /// Digest-bearing image reference for `platform`, when declared.
    #[must_use]
    pub fn image_ref(&self, platform: Platform) -> Option<&str> {
        self.image.platforms.get(&platform).map(String::as_str)
    }

    /// Normalized pinned digest for `platform`. `None` when the platform
    /// is undeclared or still carries the placeholder.
    #[must_use]
    pub fn pinned_digest(&self, platform: Platform) -> Option<String> {
        self.image_ref(platform).and_then(normalize_digest)
    }
}

/// Errors from loading a tool spec.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No spec exists for the ref. Fatal to the run (`ERR_UNKNOWN_REF`).
    #[error("no registry entry for {0}")]
    NotFound(ToolRef),
    /// The spec file exists but does not parse or violates an invariant.
    /// Surfaces as `ERR_REGISTRY`.
    #[error("malformed spec for {tool_ref}: {reason}")]
    Malformed {
        /// The offending ref.
        tool_ref: ToolRef,
        /// What is wrong with the spec.
        reason: String,
    },
    /// The spec file could not be read.
    #[error("failed to read spec for {0}: {1}")]
    Io(ToolRef, #[source] std::io::Error),
}

/// Loader over a registry root directory.
///
/// The canonical path of a spec is a pure function of the ref:
/// `<root>/<ns>/<name>/<ver>/registry.yaml`.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Create a loader rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Canonical on-disk path of the spec for `tool_ref`.
    #[must_use]
    pub fn spec_path(&self, tool_ref: &ToolRef) -> PathBuf {
        self.root
            .join(&tool_ref.namespace)
            .join(&tool_ref.name)
            .join(&tool_ref.version)
            .join("registry.yaml")
    }

    /// Load and validate the spec for `tool_ref`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when no spec file exists;
    /// [`RegistryError::Malformed`] when parsing or invariants fail.
    pub fn load(&self, tool_ref: &ToolRef) -> Result<ToolSpec, RegistryError> {
        let path = self.spec_path(tool_ref);
        if !path.exists() {
            return Err(RegistryError::NotFound(tool_ref.clone()));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| RegistryError::Io(tool_ref.clone(), e))?;
        let spec: ToolSpec =
            serde_yaml::from_str(&raw).map_err(|e| RegistryError::Malformed {
                tool_ref: tool_ref.clone(),
                reason: e.to_string(),
            })?;
        validate_spec(&spec, tool_ref)?;
        debug!(tool_ref = %tool_ref, path = %path.display(), "registry spec loaded");
        Ok(spec)
    }
}

fn validate_spec(spec: &ToolSpec, tool_ref: &ToolRef) -> Result<(), RegistryError> {
    let malformed = |reason: String| RegistryError::Malformed {
        tool_ref: tool_ref.clone(),
        reason,
    };

    if &spec.tool_ref != tool_ref {
        return Err(malformed(format!(
            "spec ref {} does not match path ref {tool_ref}",
            spec.tool_ref
        )));
    }
    if spec.image.platforms.is_empty() {
        return Err(malformed("image.platforms is empty".into()));
    }
    for (platform, image_ref) in &spec.image.platforms {
        // Either the placeholder or a digest-bearing reference.
        let digest_part = image_ref
            .rsplit_once('@')
            .map_or(image_ref.as_str(), |(_, d)| d);
        if !is_valid_spec_digest(digest_part) {
            return Err(malformed(format!(
                "image.platforms.{platform} carries an invalid digest: {image_ref:?}"
            )));
        }
    }
    if !spec.image.platforms.contains_key(&spec.image.default_platform) {
        return Err(malformed(format!(
            "default_platform {} is not declared under image.platforms",
            spec.image.default_platform
        )));
    }
    if spec.api.protocol != "ws" {
        return Err(malformed(format!(
            "api.protocol {:?} is not supported (only \"ws\")",
            spec.api.protocol
        )));
    }
    for output in &spec.outputs {
        if output.path.is_empty() || output.path.starts_with('/') || output.path.contains("..") {
            return Err(malformed(format!(
                "outputs path {:?} must be relative with no traversal",
                output.path
            )));
        }
    }
    if let Some(schema) = &spec.inputs
        && jsonschema::validator_for(schema).is_err()
    {
        return Err(malformed("inputs is not a valid JSON schema".into()));
    }
    Ok(())
}

/// Subset of `spec.secrets.required` that is present and non-empty in the
/// ambient environment. Drives the real-mode pre-flight check.
#[must_use]
pub fn secrets_present(spec: &ToolSpec) -> Vec<String> {
    spec.secrets
        .required
        .iter()
        .filter(|name| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false))
        .cloned()
        .collect()
}

/// Validate `inputs` against the spec's declared input schema.
///
/// Specs without a schema accept anything.
///
/// # Errors
///
/// Returns the first violation message.
pub fn validate_inputs(spec: &ToolSpec, inputs: &serde_json::Value) -> Result<(), String> {
    let Some(schema) = &spec.inputs else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    validator.validate(inputs).map_err(|e| e.to_string())
}
