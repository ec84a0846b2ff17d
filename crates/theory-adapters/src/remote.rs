// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote serverless lane.
//!
//! Owns no lifecycle: derive the deployed app name from the ref and the
//! deployment context, resolve its public URL, rewrite `http(s)` to
//! `ws(s)`, append `/run`, and hand off to the shared transport.

use crate::transport;
use crate::{Adapter, InvokeOutcome, InvokeRequest};
use async_trait::async_trait;
use std::sync::Arc;
use theory_core::ToolRef;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::error::ErrorCode;
use tokio::process::Command;
use tracing::debug;

/// Deployment context the app name derives from.
#[derive(Debug, Clone)]
pub struct RemoteContext {
    /// Deployment environment (`dev`, `staging`, `main`, …).
    pub environment: String,
    /// Git branch; folded into dev app names only.
    pub branch: Option<String>,
    /// Deploying user; folded into dev app names only.
    pub user: Option<String>,
}

impl RemoteContext {
    /// Resolve from the process environment: `THEORY_ENV` (default `dev`),
    /// `GITHUB_HEAD_REF`/`GITHUB_REF_NAME`/`BRANCH_NAME` for the branch,
    /// `GITHUB_ACTOR`/`USER` for the user.
    #[must_use]
    pub fn from_env() -> Self {
        let branch = ["GITHUB_HEAD_REF", "GITHUB_REF_NAME", "BRANCH_NAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        let user = ["GITHUB_ACTOR", "USER"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        Self {
            environment: std::env::var("THEORY_ENV").unwrap_or_else(|_| "dev".into()),
            branch,
            user,
        }
    }
}

/// Derive the deployed app name for a ref.
///
/// Pure function of `(ref, environment, branch, user)`. Dev environments
/// append branch and user so parallel deployments do not collide;
/// non-dev environments omit both.
///
/// # Examples
///
/// ```
/// use theory_adapters::remote::{RemoteContext, app_name};
///
/// let tool_ref = "llm/litellm@1".parse().unwrap();
/// let dev = RemoteContext {
///     environment: "dev".into(),
///     branch: Some("Feature/X".into()),
///     user: Some("Ada".into()),
/// };
/// assert_eq!(app_name(&tool_ref, &dev), "dev-llm-litellm-1-feature-x-ada");
///
/// let prod = RemoteContext { environment: "main".into(), branch: Some("x".into()), user: None };
/// assert_eq!(app_name(&tool_ref, &prod), "main-llm-litellm-1");
/// ```
#[must_use]
pub fn app_name(tool_ref: &ToolRef, context: &RemoteContext) -> String {
    let mut parts = vec![slugify(&context.environment), tool_ref.slug()];
    if context.environment == "dev" {
        if let Some(branch) = &context.branch {
            parts.push(slugify(branch));
        }
        if let Some(user) = &context.user {
            parts.push(slugify(user));
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join("-")
}

fn slugify(raw: &str) -> String {
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

/// Rewrite a resolved base URL to the run endpoint:
/// `http(s)` → `ws(s)`, then `/run` appended.
#[must_use]
pub fn to_run_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let rewritten = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("wss://{base}")
    };
    format!("{rewritten}/run")
}

/// Resolves a deployed app name to its public base URL.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Resolve `app_name`, e.g. via the platform CLI or API.
    async fn resolve(&self, app_name: &str) -> Result<String, String>;
}

/// Resolver that runs a configurable command and expects the URL on
/// stdout (`<cmd> <app-name>`), the shape platform CLIs print.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
}

impl CommandResolver {
    /// Resolver invoking `program` with `args` plus the app name.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl EndpointResolver for CommandResolver {
    async fn resolve(&self, app_name: &str) -> Result<String, String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(app_name)
            .output()
            .await
            .map_err(|e| format!("{} not runnable: {e}", self.program))?;
        if !output.status.success() {
            return Err(format!(
                "resolver failed for {app_name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if url.is_empty() {
            return Err(format!("resolver returned no URL for {app_name}"));
        }
        Ok(url)
    }
}

/// Resolver with a fixed answer. Tests and port-forwarded setups.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    url: String,
}

impl StaticResolver {
    /// Always resolve to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, _app_name: &str) -> Result<String, String> {
        Ok(self.url.clone())
    }
}

/// The remote adapter.
pub struct RemoteAdapter {
    context: RemoteContext,
    resolver: Arc<dyn EndpointResolver>,
}

impl RemoteAdapter {
    /// Adapter resolving endpoints through `resolver` in `context`.
    pub fn new(context: RemoteContext, resolver: Arc<dyn EndpointResolver>) -> Self {
        Self { context, resolver }
    }
}

#[async_trait]
impl Adapter for RemoteAdapter {
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        let app = app_name(&request.tool_ref, &self.context);
        let base_url = match self.resolver.resolve(&app).await {
            Ok(url) => url,
            Err(message) => {
                return InvokeOutcome::Final(ExecutionEnvelope::error(
                    &request.execution_id,
                    ErrorCode::ErrNetwork,
                    format!("could not resolve deployment {app}: {message}"),
                ));
            }
        };
        let ws_url = to_run_url(&base_url);
        debug!(app = %app, ws_url = %ws_url, "remote endpoint resolved");
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
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_ref() -> ToolRef {
        "llm/litellm@1".parse().unwrap()
    }

    #[test]
    fn dev_names_carry_branch_and_user() {
        let context = RemoteContext {
            environment: "dev".into(),
            branch: Some("feat/streaming".into()),
            user: Some("jo".into()),
        };
        assert_eq!(
            app_name(&tool_ref(), &context),
            "dev-llm-litellm-1-feat-streaming-jo"
        );
    }

    #[test]
    fn non_dev_names_omit_branch_and_user() {
        let context = RemoteContext {
            environment: "staging".into(),
            branch: Some("feat/streaming".into()),
            user: Some("jo".into()),
        };
        assert_eq!(app_name(&tool_ref(), &context), "staging-llm-litellm-1");
    }

    #[test]
    fn app_name_is_deterministic() {
        let context = RemoteContext {
            environment: "dev".into(),
            branch: Some("b".into()),
            user: Some("u".into()),
        };
        assert_eq!(
            app_name(&tool_ref(), &context),
            app_name(&tool_ref(), &context)
        );
    }

    #[test]
    fn url_rewrite_covers_all_schemes() {
        assert_eq!(to_run_url("https://x.example.com"), "wss://x.example.com/run");
        assert_eq!(to_run_url("http://x:8000/"), "ws://x:8000/run");
        assert_eq!(to_run_url("wss://x"), "wss://x/run");
        assert_eq!(to_run_url("x.example.com"), "wss://x.example.com/run");
    }

    #[tokio::test]
    async fn static_resolver_resolves() {
        let resolver = StaticResolver::new("http://127.0.0.1:9");
        assert_eq!(
            resolver.resolve("anything").await.unwrap(),
            "http://127.0.0.1:9"
        );
    }

    #[tokio::test]
    async fn unresolvable_endpoint_becomes_err_network() {
        struct FailingResolver;
        #[async_trait]
        impl EndpointResolver for FailingResolver {
            async fn resolve(&self, _app: &str) -> Result<String, String> {
                Err("no deployment".into())
            }
        }
        let adapter = RemoteAdapter::new(
            RemoteContext {
                environment: "dev".into(),
                branch: None,
                user: None,
            },
            Arc::new(FailingResolver),
        );
        let outcome = adapter
            .invoke(InvokeRequest {
                tool_ref: tool_ref(),
                execution_id: "e-r".into(),
                payload: serde_json::json!({}),
                timeout: std::time::Duration::from_secs(5),
                stream: false,
                hints: Default::default(),
            })
            .await;
        let envelope = outcome.into_final().await;
        assert_eq!(envelope.error_code(), Some("ERR_NETWORK"));
    }
}
