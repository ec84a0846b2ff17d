// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-orchestrator
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Input hydration.
pub mod hydrate;
/// Dual determinism receipts.
pub mod receipts;

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use theory_adapters::transport::EventStream;
use theory_adapters::{Adapter, InvokeOutcome, InvokeRequest, LaneHints};
use theory_core::digest::normalize_digest;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use theory_core::frame::WsFrame;
use theory_core::receipt::{ReceiptBuilder, inputs_fingerprint};
use theory_core::worldpath::{ends_in_reserved_outputs, expand_write_prefix};
use theory_core::{Lane, Mode, ToolRef};
use theory_ledger::{Ledger, SettleFailure, SettleSuccess};
use theory_presign::Presigner;
use theory_registry::{Platform, Registry, RegistryError, ToolSpec, validate_inputs};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default micro-unit estimate reserved per execution when the spec gives
/// no better number.
pub const DEFAULT_ESTIMATE_HI_MICRO: i64 = 1000;

/// TTL slack added on top of the run deadline for presigned URLs.
const URL_TTL_SLACK: Duration = Duration::from_secs(60);

/// Repository prefix of locally built tool images.
const BUILD_IMAGE_PREFIX: &str = "theory-local/";

/// Orchestrator wiring: catalogs, storage, accounting.
///
/// Cheap to clone: every field is a handle.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Registry,
    presigner: Presigner,
    bucket: String,
    world: String,
    ledger: Ledger,
    global_receipt_base: PathBuf,
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Tool to execute.
    pub tool_ref: ToolRef,
    /// Mock or real.
    pub mode: Mode,
    /// Tool inputs.
    pub inputs: Value,
    /// Build or pinned lane.
    pub lane: Lane,
    /// Stream events or return the envelope only.
    pub stream: bool,
    /// Overall deadline; `None` takes the spec's `runtime.timeout_s`.
    pub timeout_s: Option<u64>,
    /// Caller-supplied execution id; generated when absent.
    pub execution_id: Option<String>,
    /// Caller-supplied write prefix; defaulted when absent.
    pub write_prefix: Option<String>,
    /// Plan key for budget settlement.
    pub plan: Option<String>,
    /// Platform override for pinned-digest selection.
    pub platform: Option<Platform>,
}

impl InvokeOptions {
    /// Minimal options for `tool_ref` in mock mode, pinned lane.
    #[must_use]
    pub fn new(tool_ref: ToolRef, inputs: Value) -> Self {
        Self {
            tool_ref,
            mode: Mode::Mock,
            inputs,
            lane: Lane::Pinned,
            stream: false,
            timeout_s: None,
            execution_id: None,
            write_prefix: None,
            plan: None,
            platform: None,
        }
    }
}

impl Orchestrator {
    /// Build an orchestrator.
    ///
    /// `world` scopes which `world://` references inputs may carry;
    /// `bucket` is the object-storage bucket everything lands in.
    pub fn new(
        registry: Registry,
        presigner: Presigner,
        bucket: impl Into<String>,
        world: impl Into<String>,
        ledger: Ledger,
    ) -> Self {
        let global_receipt_base = receipts::global_receipt_base();
        debug!(base = %global_receipt_base.display(), "global receipt base resolved");
        Self {
            registry,
            presigner,
            bucket: bucket.into(),
            world: world.into(),
            ledger,
            global_receipt_base,
        }
    }

    /// Access the ledger (tests, CLI status output).
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Execute one tool run through `adapter`.
    ///
    /// Never returns an error: every failure becomes an error envelope,
    /// final or at the end of the stream.
    pub async fn invoke(&self, adapter: &dyn Adapter, options: InvokeOptions) -> InvokeOutcome {
        let execution_id = options
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = Utc::now();

        match self.prepare(adapter, &options, &execution_id) {
            Ok(prepared) => {
                self.run_prepared(adapter, options, prepared, execution_id, started_at)
                    .await
            }
            Err(envelope) => {
                // Pre-flight failures happen before any reservation, so
                // there is nothing to settle.
                let envelope = self
                    .finish(&options, None, envelope, &execution_id, started_at, false)
                    .await;
                self.wrap_failure(options.stream, envelope)
            }
        }
    }

    fn wrap_failure(&self, stream: bool, envelope: ExecutionEnvelope) -> InvokeOutcome {
        if stream {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let _ = tx.try_send(WsFrame::RunResult(envelope));
            InvokeOutcome::Stream(EventStream::from_channel(rx))
        } else {
            InvokeOutcome::Final(envelope)
        }
    }

    /// Steps 1–6: everything before the adapter, all synchronous.
    fn prepare(
        &self,
        adapter: &dyn Adapter,
        options: &InvokeOptions,
        execution_id: &str,
    ) -> Result<Prepared, ExecutionEnvelope> {
        let fail = |code: ErrorCode, message: String| {
            ExecutionEnvelope::error(execution_id, code, message)
        };

        // 1. Registry.
        let spec = self.registry.load(&options.tool_ref).map_err(|err| match err {
            RegistryError::NotFound(tool_ref) => fail(
                ErrorCode::ErrUnknownRef,
                format!("unknown tool ref: {tool_ref}"),
            ),
            other => fail(ErrorCode::ErrRegistry, other.to_string()),
        })?;

        // Inputs must satisfy the spec's declared schema.
        validate_inputs(&spec, &options.inputs)
            .map_err(|reason| fail(ErrorCode::ErrInputs, format!("inputs rejected: {reason}")))?;

        // 3. Write prefix.
        let raw_prefix = options.write_prefix.clone().unwrap_or_else(|| {
            format!(
                "/artifacts/{}/{}/{}/{{execution_id}}/",
                options.tool_ref.namespace, options.tool_ref.name, options.tool_ref.version
            )
        });
        if ends_in_reserved_outputs(&raw_prefix) {
            return Err(fail(
                ErrorCode::ErrPrefixTemplate,
                format!("write prefix must not end in /outputs: {raw_prefix}"),
            ));
        }
        let write_prefix = expand_write_prefix(&raw_prefix, execution_id)
            .map_err(|err| fail(ErrorCode::ErrPrefixTemplate, err.to_string()))?;

        // 4. Lane.
        let remote = adapter.name() == "remote";
        let (image_ref, expected_digest) = match options.lane {
            Lane::Build => {
                if remote {
                    return Err(fail(
                        ErrorCode::ErrInputs,
                        "the remote adapter does not support the build lane; use the pinned lane"
                            .into(),
                    ));
                }
                let tag = format!(
                    "{BUILD_IMAGE_PREFIX}{}-{}:{}",
                    options.tool_ref.namespace, options.tool_ref.name, options.tool_ref.version
                );
                (Some(tag), None)
            }
            Lane::Pinned => {
                let platform = options.platform.unwrap_or(if remote {
                    Platform::Amd64
                } else {
                    Platform::host()
                });
                let image_ref = spec.image_ref(platform).map(String::from);
                if image_ref.is_none() && !remote {
                    return Err(fail(
                        ErrorCode::ErrRegistry,
                        format!("no image declared for platform {platform}"),
                    ));
                }
                (image_ref, spec.pinned_digest(platform))
            }
        };

        // 5. Secrets: resolved before any container starts.
        let mut env = BTreeMap::new();
        if options.mode == Mode::Real {
            for name in &spec.secrets.required {
                match std::env::var(name) {
                    Ok(value) if !value.is_empty() => {
                        env.insert(name.clone(), value);
                    }
                    _ => {
                        return Err(fail(
                            ErrorCode::ErrMissingSecret,
                            format!("missing required secret: {name}"),
                        ));
                    }
                }
            }
        }

        // 6. Presigned URLs.
        let timeout = Duration::from_secs(
            options.timeout_s.unwrap_or(spec.runtime.timeout_s),
        );
        let ttl = timeout + URL_TTL_SLACK;
        let mut put_urls = BTreeMap::new();
        let key_base = write_prefix.trim_start_matches('/');
        for output in &spec.outputs {
            let key = format!("outputs/{}", output.path);
            let url = self
                .presigner
                .put_url(
                    &self.bucket,
                    &format!("{key_base}{key}"),
                    ttl,
                    Some(output.mime.as_deref().unwrap_or("application/octet-stream")),
                )
                .map_err(|err| fail(ErrorCode::ErrInputs, err.to_string()))?;
            put_urls.insert(key, url);
        }
        let index_url = self
            .presigner
            .put_url(
                &self.bucket,
                &format!("{key_base}outputs.json"),
                ttl,
                Some("application/json"),
            )
            .map_err(|err| fail(ErrorCode::ErrInputs, err.to_string()))?;
        put_urls.insert("outputs.json".into(), index_url);

        let inputs = hydrate::hydrate_inputs(
            &options.inputs,
            &self.world,
            &self.bucket,
            &self.presigner,
            ttl,
        )
        .map_err(|err| fail(ErrorCode::ErrInputs, err.to_string()))?;

        Ok(Prepared {
            spec,
            write_prefix,
            image_ref,
            expected_digest,
            env,
            put_urls,
            inputs,
            timeout,
        })
    }

    /// Steps 7–10: adapter invoke, digest guard, receipts, settlement.
    async fn run_prepared(
        &self,
        adapter: &dyn Adapter,
        options: InvokeOptions,
        prepared: Prepared,
        execution_id: String,
        started_at: chrono::DateTime<Utc>,
    ) -> InvokeOutcome {
        // Reserve before work so a crashed run still settles to zero.
        let reserved = if let Some(plan) = &options.plan {
            match self.reserve(plan, &execution_id) {
                Ok(amount) => Some(amount),
                Err(message) => {
                    let envelope =
                        ExecutionEnvelope::error(&execution_id, ErrorCode::ErrInputs, message);
                    return self.wrap_failure(options.stream, envelope);
                }
            }
        } else {
            None
        };

        let payload = json!({
            "execution_id": execution_id.clone(),
            "mode": options.mode,
            "inputs": prepared.inputs.clone(),
            "write_prefix": prepared.write_prefix.clone(),
            "put_urls": prepared.put_urls.clone(),
            "timeout_s": prepared.timeout.as_secs(),
            "settle": "fast",
        });
        let request = InvokeRequest {
            tool_ref: options.tool_ref.clone(),
            execution_id: execution_id.clone(),
            payload,
            timeout: prepared.timeout,
            stream: options.stream,
            hints: LaneHints {
                image_ref: prepared.image_ref.clone(),
                expected_digest: prepared.expected_digest.clone(),
                env: prepared.env.clone(),
            },
        };

        info!(
            tool_ref = %options.tool_ref,
            execution_id = %execution_id,
            adapter = adapter.name(),
            lane = ?options.lane,
            "invoke start"
        );

        match adapter.invoke(request).await {
            InvokeOutcome::Final(envelope) => {
                let envelope = self
                    .finish(
                        &options,
                        Some(&prepared),
                        envelope,
                        &execution_id,
                        started_at,
                        reserved.is_some(),
                    )
                    .await;
                InvokeOutcome::Final(envelope)
            }
            InvokeOutcome::Stream(stream) => {
                InvokeOutcome::Stream(self.post_process_stream(
                    options,
                    prepared,
                    stream,
                    execution_id,
                    started_at,
                    reserved.is_some(),
                ))
            }
        }
    }

    /// Forward pre-terminal frames untouched; intercept the terminal for
    /// the digest guard, receipts, and settlement, then emit it last.
    fn post_process_stream(
        &self,
        options: InvokeOptions,
        prepared: Prepared,
        mut upstream: EventStream,
        execution_id: String,
        started_at: chrono::DateTime<Utc>,
        reserved: bool,
    ) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let this = self.clone();
        tokio::spawn(async move {
            let mut terminal = None;
            while let Some(frame) = upstream.next().await {
                match frame {
                    WsFrame::RunResult(envelope) => {
                        terminal = Some(envelope);
                        break;
                    }
                    other => {
                        if tx.send(other).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let envelope = terminal.unwrap_or_else(|| {
                ExecutionEnvelope::error(
                    &execution_id,
                    ErrorCode::ErrBadResponse,
                    "stream ended without a RunResult",
                )
            });
            let envelope = this
                .finish(
                    &options,
                    Some(&prepared),
                    envelope,
                    &execution_id,
                    started_at,
                    reserved,
                )
                .await;
            let _ = tx.send(WsFrame::RunResult(envelope)).await;
        });
        EventStream::from_channel(rx)
    }

    /// The post-adapter pipeline: digest guard → receipts → settlement.
    async fn finish(
        &self,
        options: &InvokeOptions,
        prepared: Option<&Prepared>,
        envelope: ExecutionEnvelope,
        execution_id: &str,
        started_at: chrono::DateTime<Utc>,
        reserved: bool,
    ) -> ExecutionEnvelope {
        let envelope = match prepared {
            Some(prepared) => self.digest_guard(prepared, envelope, execution_id),
            None => envelope,
        };

        // Receipts for every completed execution, success or error.
        if let Some(prepared) = prepared {
            let receipt_paths = self
                .write_receipts(options, prepared, &envelope, execution_id, started_at)
                .await;

            if reserved && let Some(plan) = &options.plan {
                self.settle(plan, execution_id, &envelope, &receipt_paths.local_path);
            }
        } else if reserved && let Some(plan) = &options.plan {
            self.settle(plan, execution_id, &envelope, "");
        }

        info!(
            execution_id = %execution_id,
            status = if envelope.is_error() { "error" } else { "success" },
            code = envelope.error_code().unwrap_or(""),
            "invoke settle"
        );
        envelope
    }

    /// Step 8: the supply-chain check. A reported digest differing from
    /// the pinned one overrides even a successful run.
    fn digest_guard(
        &self,
        prepared: &Prepared,
        envelope: ExecutionEnvelope,
        execution_id: &str,
    ) -> ExecutionEnvelope {
        let Some(expected) = prepared
            .expected_digest
            .as_deref()
            .and_then(normalize_digest)
        else {
            return envelope;
        };
        let actual = envelope
            .meta
            .image_digest
            .as_deref()
            .and_then(normalize_digest);
        if actual.as_deref() == Some(expected.as_str()) {
            return envelope;
        }
        // An error envelope with no digest failed before the image was
        // ever attested; the original error is the useful one.
        if actual.is_none() && envelope.is_error() {
            return envelope;
        }

        let actual_str = envelope
            .meta
            .image_digest
            .clone()
            .unwrap_or_else(|| "missing".into());
        warn!(
            execution_id = %execution_id,
            expected = %expected,
            actual = %actual_str,
            "image digest drift detected"
        );
        let mut drifted = ExecutionEnvelope::error(
            execution_id,
            ErrorCode::ErrRegistryMismatch,
            format!("image digest mismatch: expected {expected}, got {actual_str}"),
        );
        drifted.meta = envelope.meta.clone();
        drifted
            .meta
            .extra
            .insert("expected_digest".into(), json!(expected));
        drifted
            .meta
            .extra
            .insert("actual_digest".into(), json!(actual_str));
        drifted
    }

    async fn write_receipts(
        &self,
        options: &InvokeOptions,
        prepared: &Prepared,
        envelope: &ExecutionEnvelope,
        execution_id: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> receipts::ReceiptPaths {
        let fingerprint = inputs_fingerprint(&options.inputs).unwrap_or_default();
        let model = envelope
            .meta
            .extra
            .get("model")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                options.inputs["params"]["model"]
                    .as_str()
                    .map(String::from)
            });
        let env_fingerprint = envelope
            .meta
            .env_fingerprint
            .clone()
            .unwrap_or_else(|| prepared.spec.runtime.env_fingerprint());
        let mut builder = ReceiptBuilder::new(
            options.tool_ref.to_string(),
            execution_id,
            started_at,
        )
        .completed(!envelope.is_error())
        .model(model)
        .inputs_fingerprint(fingerprint)
        .env_fingerprint(env_fingerprint)
        .image_digest(
            envelope.meta.image_digest.clone(),
            prepared.image_ref.as_deref(),
        );
        if let Some(plan) = &options.plan {
            builder = builder.extra("plan_id", json!(plan));
        }
        let receipt = builder.build();

        receipts::write_dual_receipts(
            &receipt,
            &prepared.write_prefix,
            &self.bucket,
            &self.presigner,
            &self.global_receipt_base,
        )
        .await
    }

    fn reserve(&self, plan: &str, execution_id: &str) -> Result<i64, String> {
        self.ledger
            .ensure_plan(plan, 0)
            .map_err(|e| e.to_string())?;
        self.ledger
            .reserve(plan, DEFAULT_ESTIMATE_HI_MICRO)
            .map_err(|e| e.to_string())?;
        debug!(plan = %plan, execution_id = %execution_id, micro = DEFAULT_ESTIMATE_HI_MICRO, "budget reserved");
        Ok(DEFAULT_ESTIMATE_HI_MICRO)
    }

    /// Step 9: settlement. Success takes the metered actual (or the
    /// estimate high-watermark); failure refunds everything but metering.
    fn settle(
        &self,
        plan: &str,
        execution_id: &str,
        envelope: &ExecutionEnvelope,
        determinism_uri: &str,
    ) {
        let result = if envelope.is_error() {
            let metered = envelope
                .meta
                .extra
                .get("actual_micro")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            self.ledger.settle_failure(&SettleFailure {
                plan: plan.into(),
                execution_id: execution_id.into(),
                estimate_hi_micro: DEFAULT_ESTIMATE_HI_MICRO,
                metered_actual_micro: metered,
                reason: envelope.error_code().unwrap_or("ERR_RUNTIME").into(),
            })
        } else {
            let actual = envelope
                .meta
                .extra
                .get("actual_micro")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_ESTIMATE_HI_MICRO);
            self.ledger.settle_success(&SettleSuccess {
                plan: plan.into(),
                execution_id: execution_id.into(),
                estimate_hi_micro: DEFAULT_ESTIMATE_HI_MICRO,
                actual_micro: actual,
                determinism_uri: determinism_uri.into(),
            })
        };
        if let Err(err) = result {
            warn!(plan = %plan, execution_id = %execution_id, error = %err, "settlement failed");
        }
    }

}

/// Everything resolved before the adapter runs.
struct Prepared {
    spec: ToolSpec,
    write_prefix: String,
    image_ref: Option<String>,
    expected_digest: Option<String>,
    env: BTreeMap<String, String>,
    put_urls: BTreeMap<String, String>,
    inputs: Value,
    timeout: Duration,
}
