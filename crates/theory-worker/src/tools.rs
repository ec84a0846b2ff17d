// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in tools.
//!
//! Only the wire contract of a tool matters to the execution plane; these
//! implementations exist so images have something real to run. `llm/litellm@1`
//! answers chat-style inputs: deterministic fixtures in mock mode, an
//! OpenAI-compatible chat-completions call in real mode.

use crate::{Tool, ToolCtx, ToolFailure, ToolOutput};
use async_trait::async_trait;
use serde_json::Value;
use theory_core::Mode;
use theory_core::error::ErrorCode;

/// Default model when the inputs do not pick one.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// How much of the last user message the mock reply echoes.
const MOCK_ECHO_LIMIT: usize = 64;

/// Pause between mock tokens so the stream behaves like a live one.
const MOCK_TOKEN_CADENCE: std::time::Duration = std::time::Duration::from_millis(25);

/// The chat LLM tool (`llm/litellm@1`).
#[derive(Debug, Default)]
pub struct LitellmTool;

impl LitellmTool {
    fn last_user_content(inputs: &Value) -> String {
        inputs["params"]["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .chars()
            .take(MOCK_ECHO_LIMIT)
            .collect()
    }

    fn model_of(inputs: &Value) -> String {
        inputs["params"]["model"]
            .as_str()
            .unwrap_or(DEFAULT_MODEL)
            .to_string()
    }

    async fn complete_real(
        &self,
        ctx: &ToolCtx,
        model: &str,
        messages: &Value,
    ) -> Result<String, ToolFailure> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ToolFailure::new(ErrorCode::ErrMissingSecret, "OPENAI_API_KEY missing")
            })?;
        let base = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".into());

        ctx.log(format!("calling provider model={model}")).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&serde_json::json!({"model": model, "messages": messages}))
            .send()
            .await
            .map_err(|e| ToolFailure::new(ErrorCode::ErrProvider, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolFailure::new(
                ErrorCode::ErrProvider,
                format!("provider returned HTTP {}", resp.status()),
            ));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ToolFailure::new(ErrorCode::ErrProvider, e.to_string()))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                ToolFailure::new(ErrorCode::ErrProvider, "provider reply missing content")
            })
    }
}

#[async_trait]
impl Tool for LitellmTool {
    async fn entry(&self, ctx: &mut ToolCtx) -> Result<ToolOutput, ToolFailure> {
        let inputs = ctx.payload.inputs.clone();
        let model = Self::model_of(&inputs);
        ctx.phase("started").await;

        let text = match ctx.payload.mode {
            Mode::Mock => {
                let text = format!("Mock response: {}", Self::last_user_content(&inputs));
                // Stream word by word at a simulated cadence, honoring
                // preemption between tokens.
                for word in text.split_inclusive(' ') {
                    if ctx.cancel.is_cancelled() {
                        return Err(ToolFailure::new(
                            ErrorCode::ErrPreempted,
                            "cancel flag observed",
                        ));
                    }
                    ctx.token(word).await;
                    tokio::time::sleep(MOCK_TOKEN_CADENCE).await;
                }
                text
            }
            Mode::Real => {
                let text = self
                    .complete_real(ctx, &model, &inputs["params"]["messages"])
                    .await?;
                if ctx.cancel.is_cancelled() {
                    return Err(ToolFailure::new(
                        ErrorCode::ErrPreempted,
                        "cancel flag observed",
                    ));
                }
                ctx.token(text.clone()).await;
                text
            }
        };

        ctx.put_output("text/response.txt", text.into_bytes(), "text/plain")
            .await?;
        ctx.phase("completed").await;

        Ok(ToolOutput {
            model: Some(model),
            extra_meta: Default::default(),
        })
    }
}

/// Resolve a built-in tool by ref string. The worker binary selects with
/// the `THEORY_TOOL` environment hint baked into each image.
#[must_use]
pub fn builtin(tool_ref: &str) -> Option<Box<dyn Tool>> {
    match tool_ref {
        "llm/litellm@1" => Some(Box::new(LitellmTool)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{INDEX_KEY, RunnerEnv, WorkerPayload, run_tool};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use theory_core::cancel::CancelFlag;
    use theory_core::frame::WsFrame;
    use theory_presign::Presigner;
    use theory_presign::store::{ObjectStore, serve_ephemeral};
    use tokio::sync::mpsc;

    async fn mock_payload(message: &str) -> (WorkerPayload, ObjectStore) {
        let store = ObjectStore::new();
        let addr = serve_ephemeral("s", store.clone()).await.unwrap();
        let presigner = Presigner::new(format!("http://{addr}"), "s");
        let prefix = "artifacts/t/e-1/";
        let mut put_urls = BTreeMap::new();
        for (key, ct) in [
            ("outputs/text/response.txt", "text/plain"),
            (INDEX_KEY, "application/json"),
        ] {
            put_urls.insert(
                key.to_string(),
                presigner
                    .put_url(
                        "outputs",
                        &format!("{prefix}{key}"),
                        Duration::from_secs(60),
                        Some(ct),
                    )
                    .unwrap(),
            );
        }
        (
            WorkerPayload {
                execution_id: "e-1".into(),
                mode: theory_core::Mode::Mock,
                inputs: serde_json::json!({
                    "schema": "v1",
                    "params": {"messages": [{"role": "user", "content": message}]}
                }),
                write_prefix: "/artifacts/t/{execution_id}/".into(),
                put_urls,
                settle: None,
            },
            store,
        )
    }

    fn env() -> RunnerEnv {
        RunnerEnv {
            image_digest: Some(format!("sha256:{}", "b".repeat(64))),
            env_fingerprint: "cpu:1;memory:2Gi".into(),
        }
    }

    #[tokio::test]
    async fn mock_mode_echoes_and_commits() {
        let (payload, store) = mock_payload("hi").await;
        let (tx, mut rx) = mpsc::channel(256);
        let envelope = run_tool(&LitellmTool, payload, &env(), tx, CancelFlag::new()).await;

        assert!(!envelope.is_error(), "{envelope:?}");
        let body = store
            .get("outputs", "artifacts/t/e-1/outputs/text/response.txt")
            .unwrap();
        assert_eq!(String::from_utf8(body.bytes).unwrap(), "Mock response: hi");

        // Tokens streamed before the result, and they concatenate to the body.
        let mut streamed = String::new();
        while let Ok(frame) = rx.try_recv() {
            if let WsFrame::Token { text } = frame {
                streamed.push_str(&text);
            }
        }
        assert_eq!(streamed, "Mock response: hi");
        assert_eq!(
            envelope.meta.extra["model"],
            serde_json::json!("gpt-4o-mini")
        );
    }

    #[tokio::test]
    async fn mock_mode_is_deterministic() {
        let (payload_a, store_a) = mock_payload("same input").await;
        let (payload_b, store_b) = mock_payload("same input").await;
        let (tx_a, _rx_a) = mpsc::channel(256);
        let (tx_b, _rx_b) = mpsc::channel(256);
        let env_a = run_tool(&LitellmTool, payload_a, &env(), tx_a, CancelFlag::new()).await;
        let env_b = run_tool(&LitellmTool, payload_b, &env(), tx_b, CancelFlag::new()).await;

        // Same execution id in this harness, so whole envelopes match.
        assert_eq!(env_a, env_b);
        assert_eq!(
            store_a.get("outputs", "artifacts/t/e-1/outputs.json").unwrap().bytes,
            store_b.get("outputs", "artifacts/t/e-1/outputs.json").unwrap().bytes,
        );
    }

    #[tokio::test]
    async fn cancelled_mock_run_returns_preempted() {
        let (payload, _store) = mock_payload("will be cancelled").await;
        let (tx, _rx) = mpsc::channel(256);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let envelope = run_tool(&LitellmTool, payload, &env(), tx, cancel).await;
        assert_eq!(envelope.error_code(), Some("ERR_PREEMPTED"));
    }

    #[test]
    fn builtin_lookup() {
        assert!(builtin("llm/litellm@1").is_some());
        assert!(builtin("img/unknown@9").is_none());
    }
}
