// SPDX-License-Identifier: MIT OR Apache-2.0
//! The terminal execution envelope and the output index.
//!
//! The envelope is the single JSON object a worker returns when a run
//! finishes, success or error. The output index (`outputs.json`) is the
//! write barrier: it is uploaded last and lists the same outputs as the
//! envelope, sorted by path.

use crate::error::{ErrorCode, is_error_code};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run committed its outputs.
    Success,
    /// The run failed; `error` carries the code and message.
    Error,
}

/// One produced output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// World path of the artifact.
    pub path: String,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Content id, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Error block of an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Stable `ERR_*` code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Metadata block present on every envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Digest of the image that actually ran, read from `IMAGE_DIGEST`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    /// Environment fingerprint (`cpu:…;memory:…Gi[;gpu:…]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_fingerprint: Option<String>,
    /// Anything else the worker or orchestrator attaches
    /// (`model`, `expected_digest`, `actual_digest`, metering, …).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The terminal JSON object of one execution.
///
/// # Examples
///
/// ```
/// use theory_core::envelope::ExecutionEnvelope;
/// use theory_core::error::ErrorCode;
///
/// let env = ExecutionEnvelope::error("e-1", ErrorCode::ErrPreempted, "cancelled");
/// assert!(env.is_error());
/// assert_eq!(env.error.as_ref().unwrap().code, "ERR_PREEMPTED");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    /// Terminal status.
    pub status: RunStatus,
    /// Execution id assigned by the orchestrator.
    pub execution_id: String,
    /// Produced outputs, sorted by `path`. Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputRef>>,
    /// World path of the uploaded `outputs.json`. Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,
    /// Error block. Present on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
    /// Metadata block.
    #[serde(default)]
    pub meta: EnvelopeMeta,
}

/// Shape violations found by [`ExecutionEnvelope::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeInvalid {
    /// `execution_id` is empty.
    #[error("envelope missing execution_id")]
    MissingExecutionId,
    /// A success envelope is missing `outputs` or `index_path`.
    #[error("success envelope missing {0}")]
    MissingSuccessField(&'static str),
    /// An error envelope is missing its error block.
    #[error("error envelope missing error block")]
    MissingError,
    /// The error code does not carry the `ERR_` prefix.
    #[error("error code {0:?} is not an ERR_* code")]
    BadErrorCode(String),
    /// `outputs` is not sorted by path.
    #[error("outputs are not sorted by path")]
    UnsortedOutputs,
}

impl ExecutionEnvelope {
    /// Build a success envelope. `outputs` is sorted by path here so the
    /// envelope and the index agree on ordering.
    #[must_use]
    pub fn success(
        execution_id: impl Into<String>,
        mut outputs: Vec<OutputRef>,
        index_path: impl Into<String>,
        meta: EnvelopeMeta,
    ) -> Self {
        outputs.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            status: RunStatus::Success,
            execution_id: execution_id.into(),
            outputs: Some(outputs),
            index_path: Some(index_path.into()),
            error: None,
            meta,
        }
    }

    /// Build an error envelope from a catalog code.
    #[must_use]
    pub fn error(
        execution_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::error_raw(execution_id, code.as_str(), message)
    }

    /// Build an error envelope from a raw code string (tool-defined codes).
    #[must_use]
    pub fn error_raw(
        execution_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: RunStatus::Error,
            execution_id: execution_id.into(),
            outputs: None,
            index_path: None,
            error: Some(EnvelopeError {
                code: code.into(),
                message: message.into(),
            }),
            meta: EnvelopeMeta::default(),
        }
    }

    /// Returns `true` for error envelopes.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == RunStatus::Error
    }

    /// Returns the error code string, if this is an error envelope.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Validate the envelope shape against the contract.
    ///
    /// # Errors
    ///
    /// Returns the first [`EnvelopeInvalid`] violation found.
    pub fn validate(&self) -> Result<(), EnvelopeInvalid> {
        if self.execution_id.is_empty() {
            return Err(EnvelopeInvalid::MissingExecutionId);
        }
        match self.status {
            RunStatus::Success => {
                let outputs = self
                    .outputs
                    .as_ref()
                    .ok_or(EnvelopeInvalid::MissingSuccessField("outputs"))?;
                if self.index_path.is_none() {
                    return Err(EnvelopeInvalid::MissingSuccessField("index_path"));
                }
                if !outputs.windows(2).all(|w| w[0].path <= w[1].path) {
                    return Err(EnvelopeInvalid::UnsortedOutputs);
                }
            }
            RunStatus::Error => {
                let err = self.error.as_ref().ok_or(EnvelopeInvalid::MissingError)?;
                if !is_error_code(&err.code) {
                    return Err(EnvelopeInvalid::BadErrorCode(err.code.clone()));
                }
            }
        }
        Ok(())
    }
}

/// The `outputs.json` write barrier.
///
/// Uploaded last; its presence at the index key signals commit. The listed
/// outputs are the envelope's outputs sorted by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputIndex {
    /// Declared outputs, sorted by path.
    pub outputs: Vec<OutputRef>,
}

impl OutputIndex {
    /// Build an index from a list of outputs, sorting by path.
    #[must_use]
    pub fn new(mut outputs: Vec<OutputRef>) -> Self {
        outputs.sort_by(|a, b| a.path.cmp(&b.path));
        Self { outputs }
    }

    /// Canonical bytes for upload: compact JSON with sorted keys.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ContractError::Json`] if serialization fails.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, crate::ContractError> {
        Ok(crate::canonical_json(self)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(path: &str) -> OutputRef {
        OutputRef {
            path: path.into(),
            mime: None,
            size_bytes: None,
            cid: None,
        }
    }

    #[test]
    fn success_constructor_sorts_outputs() {
        let env = ExecutionEnvelope::success(
            "e-1",
            vec![out("/artifacts/t/b"), out("/artifacts/t/a")],
            "/artifacts/t/outputs.json",
            EnvelopeMeta::default(),
        );
        let outputs = env.outputs.as_ref().unwrap();
        assert_eq!(outputs[0].path, "/artifacts/t/a");
        assert_eq!(outputs[1].path, "/artifacts/t/b");
        assert!(env.validate().is_ok());
    }

    #[test]
    fn error_envelope_validates() {
        let env = ExecutionEnvelope::error("e-1", ErrorCode::ErrRuntime, "boom");
        assert!(env.validate().is_ok());
        assert_eq!(env.error_code(), Some("ERR_RUNTIME"));
    }

    #[test]
    fn success_without_index_is_invalid() {
        let mut env = ExecutionEnvelope::success(
            "e-1",
            vec![out("/artifacts/t/a")],
            "/artifacts/t/outputs.json",
            EnvelopeMeta::default(),
        );
        env.index_path = None;
        assert_eq!(
            env.validate(),
            Err(EnvelopeInvalid::MissingSuccessField("index_path"))
        );
    }

    #[test]
    fn error_without_prefix_is_invalid() {
        let env = ExecutionEnvelope::error_raw("e-1", "BOOM", "x");
        assert_eq!(
            env.validate(),
            Err(EnvelopeInvalid::BadErrorCode("BOOM".into()))
        );
    }

    #[test]
    fn missing_execution_id_is_invalid() {
        let env = ExecutionEnvelope::error("", ErrorCode::ErrInputs, "missing");
        assert_eq!(env.validate(), Err(EnvelopeInvalid::MissingExecutionId));
    }

    #[test]
    fn unsorted_outputs_detected() {
        let mut env = ExecutionEnvelope::success(
            "e-1",
            vec![out("/artifacts/t/a")],
            "/artifacts/t/outputs.json",
            EnvelopeMeta::default(),
        );
        env.outputs = Some(vec![out("/artifacts/t/b"), out("/artifacts/t/a")]);
        assert_eq!(env.validate(), Err(EnvelopeInvalid::UnsortedOutputs));
    }

    #[test]
    fn index_canonical_bytes_are_stable() {
        let a = OutputIndex::new(vec![out("/artifacts/t/b"), out("/artifacts/t/a")]);
        let b = OutputIndex::new(vec![out("/artifacts/t/a"), out("/artifacts/t/b")]);
        assert_eq!(
            a.to_canonical_bytes().unwrap(),
            b.to_canonical_bytes().unwrap()
        );
    }

    #[test]
    fn meta_flattens_extra_fields() {
        let mut meta = EnvelopeMeta::default();
        meta.extra
            .insert("model".into(), serde_json::json!("gpt-4o-mini"));
        let env = ExecutionEnvelope::success("e", vec![], "/artifacts/t/outputs.json", meta);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["meta"]["model"], "gpt-4o-mini");
    }
}
