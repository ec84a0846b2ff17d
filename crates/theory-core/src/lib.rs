// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Theory execution plane.

/// Cooperative cancellation flag shared between the supervisor and workers.
pub mod cancel;
/// Image digest normalization and comparison.
pub mod digest;
/// Terminal execution envelope and output index.
pub mod envelope;
/// Error-code catalog (`ERR_*`).
pub mod error;
/// Wire frames for the `theory.run.v1` WebSocket protocol.
pub mod frame;
/// Determinism receipts written alongside outputs.
pub mod receipt;
/// Canonical world paths and write-prefix expansion.
pub mod worldpath;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// WebSocket subprotocol every supervisor requires and every adapter offers.
///
/// # Examples
///
/// ```
/// assert_eq!(theory_core::RUN_SUBPROTOCOL, "theory.run.v1");
/// ```
pub const RUN_SUBPROTOCOL: &str = "theory.run.v1";

/// Path suffix of the run endpoint inside a tool container.
pub const RUN_PATH: &str = "/run";

/// Path suffix of the health endpoint inside a tool container.
pub const HEALTHZ_PATH: &str = "/healthz";

/// Maximum size of a single WebSocket text frame. Larger payloads travel
/// through presigned PUT, never over the socket.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Identifies one versioned tool: `ns/name@ver`.
///
/// A `ToolRef` is an identifier only; it carries no behavior. The on-disk
/// registry path, container names, and remote app names are all derived
/// from it.
///
/// # Examples
///
/// ```
/// use theory_core::ToolRef;
///
/// let r: ToolRef = "llm/litellm@1".parse().unwrap();
/// assert_eq!(r.namespace, "llm");
/// assert_eq!(r.name, "litellm");
/// assert_eq!(r.version, "1");
/// assert_eq!(r.to_string(), "llm/litellm@1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolRef {
    /// Namespace segment (`llm` in `llm/litellm@1`).
    pub namespace: String,
    /// Tool name (`litellm` in `llm/litellm@1`).
    pub name: String,
    /// Version tag (`1` in `llm/litellm@1`).
    pub version: String,
}

/// Error returned when a tool ref string does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tool ref {0:?}: expected ns/name@ver")]
pub struct RefParseError(pub String);

impl ToolRef {
    /// Build a ref from its three parts without validation of content.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Lowercase slug safe for container and app names: `ns-name-ver`
    /// with every non `[a-z0-9-]` run collapsed to a single dash.
    #[must_use]
    pub fn slug(&self) -> String {
        let raw = format!("{}-{}-{}", self.namespace, self.name, self.version);
        let mut out = String::with_capacity(raw.len());
        let mut dash = false;
        for c in raw.to_lowercase().chars() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                out.push(c);
                dash = false;
            } else if !dash {
                out.push('-');
                dash = true;
            }
        }
        out.trim_matches('-').to_string()
    }
}

impl FromStr for ToolRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ns, rest) = s.split_once('/').ok_or_else(|| RefParseError(s.into()))?;
        let (name, ver) = rest.split_once('@').ok_or_else(|| RefParseError(s.into()))?;
        if ns.is_empty() || name.is_empty() || ver.is_empty() || name.contains('/') {
            return Err(RefParseError(s.into()));
        }
        Ok(Self::new(ns, name, ver))
    }
}

impl TryFrom<String> for ToolRef {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ToolRef> for String {
    fn from(r: ToolRef) -> Self {
        r.to_string()
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.version)
    }
}

/// Execution mode: deterministic fixtures or live providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Deterministic fixture output; no external calls allowed.
    Mock,
    /// Live execution against real providers; requires secrets.
    Real,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mock => "mock",
            Self::Real => "real",
        })
    }
}

/// Execution lane: locally built image vs registry-pinned digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Latest locally built image; digest is not enforced.
    Build,
    /// Registry-declared digest for the selected platform.
    Pinned,
}

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: object keys are
/// sorted (serde_json's map preserves a BTreeMap ordering once round-tripped
/// through `Value`) and numbers serialize consistently.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
