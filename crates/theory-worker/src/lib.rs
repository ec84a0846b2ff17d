// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-worker
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Built-in tools.
pub mod tools;
/// Presigned PUT with bounded retry.
pub mod upload;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use theory_core::cancel::CancelFlag;
use theory_core::envelope::{
    EnvelopeMeta, ExecutionEnvelope, OutputIndex, OutputRef,
};
use theory_core::error::ErrorCode;
use theory_core::frame::WsFrame;
use theory_core::worldpath::expand_write_prefix;
use theory_core::{Mode, sha256_hex};
use tokio::sync::mpsc;
use tracing::debug;

/// Key of the index object in the presigned PUT map.
pub const INDEX_KEY: &str = "outputs.json";

/// The payload a worker receives from the orchestrator via the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayload {
    /// Execution id. Required.
    #[serde(default)]
    pub execution_id: String,
    /// Execution mode.
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Opaque tool inputs.
    #[serde(default)]
    pub inputs: Value,
    /// Write prefix, possibly carrying `{execution_id}`.
    #[serde(default)]
    pub write_prefix: String,
    /// Presigned PUT URLs keyed relative to the write prefix.
    #[serde(default)]
    pub put_urls: BTreeMap<String, String>,
    /// Settlement hint, passed through for accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle: Option<String>,
}

fn default_mode() -> Mode {
    Mode::Mock
}

/// A tool-level failure carrying its wire code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolFailure {
    /// `ERR_*` code surfaced in the envelope.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ToolFailure {
    /// Failure from a catalog code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().into(),
            message: message.into(),
        }
    }
}

/// What a tool hands back on success. Artifact uploads happen through the
/// context as the tool runs; this carries only metadata.
#[derive(Debug, Default)]
pub struct ToolOutput {
    /// Model used, when meaningful.
    pub model: Option<String>,
    /// Extra fields merged into the envelope's `meta`.
    pub extra_meta: BTreeMap<String, Value>,
}

/// Execution context handed to a tool's entry function.
pub struct ToolCtx {
    /// The payload, with `write_prefix` already expanded.
    pub payload: WorkerPayload,
    /// Cooperative cancel flag; tools check it between units of work.
    pub cancel: CancelFlag,
    emitter: mpsc::Sender<WsFrame>,
    client: reqwest::Client,
    produced: Vec<OutputRef>,
}

impl ToolCtx {
    /// Emit a token frame.
    pub async fn token(&self, text: impl Into<String>) {
        let _ = self.emitter.send(WsFrame::Token { text: text.into() }).await;
    }

    /// Emit a log frame.
    pub async fn log(&self, msg: impl Into<String>) {
        let _ = self
            .emitter
            .send(WsFrame::Log {
                msg: msg.into(),
                fields: BTreeMap::new(),
            })
            .await;
    }

    /// Emit a lifecycle phase event.
    pub async fn phase(&self, phase: &str) {
        let _ = self.emitter.send(WsFrame::phase(phase)).await;
    }

    /// Upload one artifact through its planned presigned URL and record it.
    ///
    /// `rel_path` is relative to the run's `outputs/` subtree
    /// (e.g. `text/response.txt`).
    ///
    /// # Errors
    ///
    /// `ERR_UPLOAD_PLAN` when no URL was planned for the key;
    /// `ERR_UPLOAD` when the PUT fails after retries.
    pub async fn put_output(
        &mut self,
        rel_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<OutputRef, ToolFailure> {
        let key = format!("outputs/{rel_path}");
        let url = self.payload.put_urls.get(&key).ok_or_else(|| {
            ToolFailure::new(
                ErrorCode::ErrUploadPlan,
                format!("missing put_url for {key}"),
            )
        })?;
        let size = bytes.len() as u64;
        let cid = format!("sha256:{}", sha256_hex(&bytes));
        upload::put_bytes(&self.client, url, bytes, content_type)
            .await
            .map_err(|e| {
                ToolFailure::new(ErrorCode::ErrUpload, format!("failed to upload {key}: {e}"))
            })?;

        let output = OutputRef {
            path: format!("{}{key}", self.payload.write_prefix),
            mime: Some(content_type.to_string()),
            size_bytes: Some(size),
            cid: Some(cid),
        };
        let _ = self
            .emitter
            .send(WsFrame::Frame {
                path: output.path.clone(),
                mime: output.mime.clone(),
            })
            .await;
        self.produced.push(output.clone());
        Ok(output)
    }
}

/// A tool's entry point, mirrored by every processor image.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Run the tool against the context. Artifacts go out through
    /// [`ToolCtx::put_output`]; the return value is metadata only.
    async fn entry(&self, ctx: &mut ToolCtx) -> Result<ToolOutput, ToolFailure>;
}

/// Ambient facts the runner resolves once per process.
#[derive(Debug, Clone)]
pub struct RunnerEnv {
    /// Value of `IMAGE_DIGEST`. Absence is fatal.
    pub image_digest: Option<String>,
    /// Environment fingerprint reported in envelopes and receipts.
    pub env_fingerprint: String,
}

impl RunnerEnv {
    /// Resolve from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            image_digest: std::env::var("IMAGE_DIGEST").ok().filter(|v| !v.is_empty()),
            env_fingerprint: std::env::var("THEORY_ENV_FINGERPRINT")
                .unwrap_or_else(|_| "cpu:1;memory:2Gi".into()),
        }
    }
}

/// Execute one run: validate the payload, drive the tool, upload the index
/// last, and return the single terminal envelope. Every failure path
/// produces an error envelope; nothing is raised past this function.
pub async fn run_tool(
    tool: &dyn Tool,
    mut payload: WorkerPayload,
    env: &RunnerEnv,
    emitter: mpsc::Sender<WsFrame>,
    cancel: CancelFlag,
) -> ExecutionEnvelope {
    let execution_id = payload.execution_id.trim().to_string();
    if execution_id.is_empty() {
        return ExecutionEnvelope::error(String::new(), ErrorCode::ErrInputs, "missing execution_id");
    }

    match expand_write_prefix(&payload.write_prefix, &execution_id) {
        Ok(expanded) => payload.write_prefix = expanded,
        Err(err) => {
            return ExecutionEnvelope::error(execution_id, ErrorCode::ErrPrefixTemplate, err.to_string());
        }
    }

    let Some(image_digest) = env.image_digest.clone() else {
        return ExecutionEnvelope::error(
            execution_id,
            ErrorCode::ErrImageDigestMissing,
            "IMAGE_DIGEST not set",
        );
    };

    let mut meta = EnvelopeMeta {
        image_digest: Some(image_digest),
        env_fingerprint: Some(env.env_fingerprint.clone()),
        extra: BTreeMap::new(),
    };

    let mut ctx = ToolCtx {
        payload,
        cancel,
        emitter,
        client: reqwest::Client::new(),
        produced: Vec::new(),
    };

    let result = tool.entry(&mut ctx).await;
    let ToolCtx {
        payload, produced, client, ..
    } = ctx;

    match result {
        Ok(output) => {
            // outputs.json goes up LAST: its presence is the commit barrier.
            let index = OutputIndex::new(produced.clone());
            let index_bytes = match index.to_canonical_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    return ExecutionEnvelope::error(
                        execution_id,
                        ErrorCode::ErrRuntime,
                        format!("index serialization failed: {err}"),
                    );
                }
            };
            let Some(index_url) = payload.put_urls.get(INDEX_KEY) else {
                return ExecutionEnvelope::error(
                    execution_id,
                    ErrorCode::ErrUploadPlan,
                    format!("missing put_url for {INDEX_KEY}"),
                );
            };
            if let Err(err) =
                upload::put_bytes(&client, index_url, index_bytes, "application/json").await
            {
                return ExecutionEnvelope::error(
                    execution_id,
                    ErrorCode::ErrUpload,
                    format!("failed to upload {INDEX_KEY}: {err}"),
                );
            }
            debug!(execution_id = %execution_id, outputs = produced.len(), "index committed");

            if let Some(model) = output.model {
                meta.extra.insert("model".into(), Value::String(model));
            }
            meta.extra.extend(output.extra_meta);
            ExecutionEnvelope::success(
                execution_id,
                produced,
                format!("{}{INDEX_KEY}", payload.write_prefix),
                meta,
            )
        }
        Err(failure) => {
            let mut envelope =
                ExecutionEnvelope::error_raw(execution_id, failure.code, failure.message);
            envelope.meta = meta;
            envelope
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use theory_presign::store::{ObjectStore, serve_ephemeral};
    use theory_presign::Presigner;
    use std::time::Duration;

    struct OneFileTool;

    #[async_trait]
    impl Tool for OneFileTool {
        async fn entry(&self, ctx: &mut ToolCtx) -> Result<ToolOutput, ToolFailure> {
            ctx.phase("started").await;
            ctx.put_output("text/response.txt", b"hello".to_vec(), "text/plain")
                .await?;
            Ok(ToolOutput::default())
        }
    }

    async fn payload_with_store() -> (WorkerPayload, ObjectStore) {
        let store = ObjectStore::new();
        let addr = serve_ephemeral("s", store.clone()).await.unwrap();
        let presigner = Presigner::new(format!("http://{addr}"), "s");
        let prefix = "artifacts/t/e-1/";
        let mut put_urls = BTreeMap::new();
        put_urls.insert(
            "outputs/text/response.txt".to_string(),
            presigner
                .put_url(
                    "outputs",
                    &format!("{prefix}outputs/text/response.txt"),
                    Duration::from_secs(60),
                    Some("text/plain"),
                )
                .unwrap(),
        );
        put_urls.insert(
            INDEX_KEY.to_string(),
            presigner
                .put_url(
                    "outputs",
                    &format!("{prefix}{INDEX_KEY}"),
                    Duration::from_secs(60),
                    Some("application/json"),
                )
                .unwrap(),
        );
        (
            WorkerPayload {
                execution_id: "e-1".into(),
                mode: Mode::Mock,
                inputs: serde_json::json!({}),
                write_prefix: "/artifacts/t/{execution_id}/".into(),
                put_urls,
                settle: None,
            },
            store,
        )
    }

    fn env() -> RunnerEnv {
        RunnerEnv {
            image_digest: Some(format!("sha256:{}", "a".repeat(64))),
            env_fingerprint: "cpu:1;memory:2Gi".into(),
        }
    }

    #[tokio::test]
    async fn success_uploads_artifact_then_index() {
        let (payload, store) = payload_with_store().await;
        let (tx, mut rx) = mpsc::channel(64);
        let envelope = run_tool(&OneFileTool, payload, &env(), tx, CancelFlag::new()).await;

        assert!(!envelope.is_error(), "{envelope:?}");
        assert!(store.contains("outputs", "artifacts/t/e-1/outputs/text/response.txt"));
        assert!(store.contains("outputs", "artifacts/t/e-1/outputs.json"));
        assert_eq!(
            envelope.index_path.as_deref(),
            Some("/artifacts/t/e-1/outputs.json")
        );
        let outputs = envelope.outputs.as_ref().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].path, "/artifacts/t/e-1/outputs/text/response.txt");
        assert_eq!(outputs[0].size_bytes, Some(5));

        // The index lists the same outputs.
        let raw = store.get("outputs", "artifacts/t/e-1/outputs.json").unwrap();
        let index: OutputIndex = serde_json::from_slice(&raw.bytes).unwrap();
        assert_eq!(&index.outputs, outputs);

        // Frames were emitted along the way.
        let mut kinds = Vec::new();
        while let Ok(f) = rx.try_recv() {
            kinds.push(serde_json::to_value(&f).unwrap()["kind"]
                .as_str()
                .unwrap()
                .to_string());
        }
        assert!(kinds.contains(&"Frame".to_string()));
    }

    #[tokio::test]
    async fn missing_execution_id_is_err_inputs() {
        let (mut payload, _store) = payload_with_store().await;
        payload.execution_id = "  ".into();
        let (tx, _rx) = mpsc::channel(8);
        let envelope = run_tool(&OneFileTool, payload, &env(), tx, CancelFlag::new()).await;
        assert_eq!(envelope.error_code(), Some("ERR_INPUTS"));
    }

    #[tokio::test]
    async fn traversal_prefix_is_err_prefix_template() {
        let (mut payload, _store) = payload_with_store().await;
        payload.write_prefix = "/artifacts/../etc/".into();
        let (tx, _rx) = mpsc::channel(8);
        let envelope = run_tool(&OneFileTool, payload, &env(), tx, CancelFlag::new()).await;
        assert_eq!(envelope.error_code(), Some("ERR_PREFIX_TEMPLATE"));
    }

    #[tokio::test]
    async fn missing_image_digest_is_fatal() {
        let (payload, _store) = payload_with_store().await;
        let (tx, _rx) = mpsc::channel(8);
        let envelope = run_tool(
            &OneFileTool,
            payload,
            &RunnerEnv {
                image_digest: None,
                env_fingerprint: String::new(),
            },
            tx,
            CancelFlag::new(),
        )
        .await;
        assert_eq!(envelope.error_code(), Some("ERR_IMAGE_DIGEST_MISSING"));
    }

    #[tokio::test]
    async fn missing_planned_url_is_err_upload_plan() {
        let (mut payload, _store) = payload_with_store().await;
        payload.put_urls.remove("outputs/text/response.txt");
        let (tx, _rx) = mpsc::channel(8);
        let envelope = run_tool(&OneFileTool, payload, &env(), tx, CancelFlag::new()).await;
        assert_eq!(envelope.error_code(), Some("ERR_UPLOAD_PLAN"));
    }

    #[tokio::test]
    async fn missing_index_url_fails_before_commit() {
        let (mut payload, store) = payload_with_store().await;
        payload.put_urls.remove(INDEX_KEY);
        let (tx, _rx) = mpsc::channel(8);
        let envelope = run_tool(&OneFileTool, payload, &env(), tx, CancelFlag::new()).await;
        assert_eq!(envelope.error_code(), Some("ERR_UPLOAD_PLAN"));
        // The artifact went up but the run did not commit: no index object.
        assert!(!store.contains("outputs", "artifacts/t/e-1/outputs.json"));
    }
}
