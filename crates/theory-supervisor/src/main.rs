// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Supervisor binary: runs inside every tool image, serving `/run` and
//! `/healthz` on port 8000.

use std::sync::Arc;
use theory_supervisor::{ProcessWorkerFactory, RunRegistry, SupervisorConfig, build_router};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    theory_telemetry::init_from_env();

    let config = SupervisorConfig::default();
    let registry = RunRegistry::new(Arc::new(ProcessWorkerFactory::from_env()), config);

    let bind = std::env::var("THEORY_SUPERVISOR_BIND").unwrap_or_else(|_| "0.0.0.0:8000".into());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "supervisor listening");

    axum::serve(listener, build_router(registry))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("supervisor shutting down");
        })
        .await?;
    Ok(())
}
