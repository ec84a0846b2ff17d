// SPDX-License-Identifier: MIT OR Apache-2.0
//! Determinism receipts.
//!
//! One receipt is produced for every completed execution, success or error.
//! A copy lives next to the outputs (`<write_prefix>receipt.json`); an
//! identical copy goes to a global execution-indexed path. The global copy
//! is best-effort and never fails the run.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Determinism receipt for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Tool ref string (`ns/name@ver`).
    pub processor: String,
    /// Model used, when the tool reports one.
    pub model: Option<String>,
    /// `"completed"` or `"failed"`.
    pub status: String,
    /// Convenience mirror of `status == "completed"`.
    pub success: bool,
    /// Execution id of the run.
    pub execution_id: String,
    /// Stable fingerprint of the canonicalized inputs.
    pub inputs_fingerprint: String,
    /// Environment fingerprint (`cpu:…;memory:…Gi[;gpu:…]`).
    pub env_fingerprint: String,
    /// Digest of the image that ran, when known.
    pub image_digest: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Completion time, ISO 8601 with `Z` suffix.
    pub timestamp_utc: String,
    /// Adapter- or plan-specific extras.
    pub extra: BTreeMap<String, Value>,
}

/// Builder for [`Receipt`]s.
#[derive(Debug)]
pub struct ReceiptBuilder {
    processor: String,
    model: Option<String>,
    status: String,
    execution_id: String,
    inputs_fingerprint: String,
    env_fingerprint: String,
    image_digest: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    extra: BTreeMap<String, Value>,
}

impl ReceiptBuilder {
    /// Start a receipt for `processor` / `execution_id`, stamped from
    /// `started_at`.
    #[must_use]
    pub fn new(
        processor: impl Into<String>,
        execution_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            processor: processor.into(),
            model: None,
            status: "completed".into(),
            execution_id: execution_id.into(),
            inputs_fingerprint: String::new(),
            env_fingerprint: String::new(),
            image_digest: None,
            started_at,
            finished_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Mark the run completed or failed.
    #[must_use]
    pub fn completed(mut self, success: bool) -> Self {
        self.status = if success { "completed" } else { "failed" }.into();
        self
    }

    /// Record the model the tool reports.
    #[must_use]
    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Record the inputs fingerprint.
    #[must_use]
    pub fn inputs_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.inputs_fingerprint = fp.into();
        self
    }

    /// Record the environment fingerprint.
    #[must_use]
    pub fn env_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.env_fingerprint = fp.into();
        self
    }

    /// Record the image digest, with a digest-bearing image ref as
    /// fallback (`…@sha256:…`).
    #[must_use]
    pub fn image_digest(mut self, digest: Option<String>, image_ref: Option<&str>) -> Self {
        self.image_digest = digest.or_else(|| {
            image_ref
                .and_then(|r| crate::digest::normalize_digest(r))
        });
        self
    }

    /// Record the completion time. Defaults to now at build time.
    #[must_use]
    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Attach an extra field.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Consume the builder and produce the receipt.
    #[must_use]
    pub fn build(self) -> Receipt {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let duration_ms = (end - self.started_at).num_milliseconds().max(0) as u64;
        Receipt {
            processor: self.processor,
            model: self.model,
            success: self.status == "completed",
            status: self.status,
            execution_id: self.execution_id,
            inputs_fingerprint: self.inputs_fingerprint,
            env_fingerprint: self.env_fingerprint,
            image_digest: self.image_digest,
            duration_ms,
            timestamp_utc: end.to_rfc3339_opts(SecondsFormat::Micros, true),
            extra: self.extra,
        }
    }
}

impl Receipt {
    /// Compact JSON bytes, identical for the local and global copies.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ContractError::Json`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::ContractError> {
        Ok(serde_json::to_vec(self).map_err(crate::ContractError::Json)?)
    }
}

/// Stable fingerprint of arbitrary inputs: SHA-256 over canonical JSON.
///
/// # Errors
///
/// Returns [`crate::ContractError::Json`] if the inputs cannot serialize.
pub fn inputs_fingerprint(inputs: &Value) -> Result<String, crate::ContractError> {
    Ok(crate::sha256_hex(crate::canonical_json(inputs)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn builder_computes_duration_and_timestamp() {
        let r = ReceiptBuilder::new("llm/litellm@1", "e-1", t0())
            .finished_at(t0() + chrono::Duration::milliseconds(1500))
            .completed(true)
            .build();
        assert_eq!(r.duration_ms, 1500);
        assert!(r.timestamp_utc.ends_with('Z'));
        assert!(r.success);
        assert_eq!(r.status, "completed");
    }

    #[test]
    fn failed_receipt_flips_success() {
        let r = ReceiptBuilder::new("llm/litellm@1", "e-1", t0())
            .finished_at(t0())
            .completed(false)
            .build();
        assert!(!r.success);
        assert_eq!(r.status, "failed");
    }

    #[test]
    fn image_digest_falls_back_to_ref() {
        let hex: String = "a".repeat(64);
        let r = ReceiptBuilder::new("llm/litellm@1", "e-1", t0())
            .finished_at(t0())
            .image_digest(None, Some(&format!("ghcr.io/t/llm@sha256:{hex}")))
            .build();
        assert_eq!(r.image_digest, Some(format!("sha256:{hex}")));
    }

    #[test]
    fn inputs_fingerprint_is_order_insensitive() {
        let a = inputs_fingerprint(&json!({"b": 1, "a": 2})).unwrap();
        let b = inputs_fingerprint(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn receipt_bytes_roundtrip() {
        let r = ReceiptBuilder::new("llm/litellm@1", "e-1", t0())
            .finished_at(t0())
            .extra("plan_id", json!("p-1"))
            .build();
        let bytes = r.to_bytes().unwrap();
        let back: Receipt = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, r);
    }
}
