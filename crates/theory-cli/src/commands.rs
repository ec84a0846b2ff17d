// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations.

use crate::config::CliConfig;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use theory_adapters::local::LocalAdapter;
use theory_adapters::remote::{CommandResolver, RemoteAdapter, RemoteContext, StaticResolver};
use theory_adapters::{Adapter, InvokeOutcome};
use theory_core::frame::WsFrame;
use theory_core::envelope::ExecutionEnvelope;
use theory_core::{Lane, Mode, ToolRef};
use theory_ledger::Ledger;
use theory_orchestrator::{InvokeOptions, Orchestrator};
use theory_presign::Presigner;
use theory_registry::{Platform, Registry};

/// Which lane the `--adapter` flag selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AdapterArg {
    /// Local Docker lane.
    Local,
    /// Remote serverless lane.
    Remote,
}

/// Flags of `theory run`.
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Tool ref (`ns/name@ver`).
    #[arg(long = "ref")]
    pub tool_ref: String,

    /// Execution mode.
    #[arg(long, default_value = "mock")]
    pub mode: String,

    /// Execution lane adapter.
    #[arg(long, value_enum, default_value_t = AdapterArg::Local)]
    pub adapter: AdapterArg,

    /// Use the locally built image instead of the pinned digest.
    #[arg(long)]
    pub build: bool,

    /// Stream events as they arrive instead of waiting for the envelope.
    #[arg(long)]
    pub stream: bool,

    /// Overall timeout in seconds (defaults to the spec's).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Write prefix override (may contain `{execution_id}`).
    #[arg(long)]
    pub write_prefix: Option<String>,

    /// Inputs as inline JSON.
    #[arg(long, conflicts_with = "inputs_file")]
    pub inputs_json: Option<String>,

    /// Inputs from a JSON file.
    #[arg(long)]
    pub inputs_file: Option<PathBuf>,

    /// Plan key to settle against.
    #[arg(long)]
    pub plan: Option<String>,

    /// Platform override for pinned-digest selection.
    #[arg(long)]
    pub platform: Option<String>,

    /// Print the envelope as a single JSON line.
    #[arg(long)]
    pub json: bool,

    /// Download every output into this directory after success.
    #[arg(long, conflicts_with = "save_first")]
    pub save_dir: Option<PathBuf>,

    /// Download only the first output to this file.
    #[arg(long)]
    pub save_first: Option<PathBuf>,
}

fn parse_mode(raw: &str) -> Result<Mode> {
    match raw {
        "mock" => Ok(Mode::Mock),
        "real" => Ok(Mode::Real),
        other => bail!("unknown mode {other:?}; expected mock or real"),
    }
}

fn parse_platform(raw: &str) -> Result<Platform> {
    match raw {
        "amd64" => Ok(Platform::Amd64),
        "arm64" => Ok(Platform::Arm64),
        other => bail!("unknown platform {other:?}; expected amd64 or arm64"),
    }
}

fn orchestrator(config: &CliConfig) -> Orchestrator {
    Orchestrator::new(
        Registry::new(&config.registry_dir),
        Presigner::new(&config.store_endpoint, &config.store_secret),
        &config.bucket,
        &config.world,
        Ledger::new(),
    )
}

fn local_adapter(config: &CliConfig) -> LocalAdapter {
    LocalAdapter::new(config.port_state_path(), &config.world_dir)
}

fn remote_adapter() -> RemoteAdapter {
    let context = RemoteContext::from_env();
    if let Ok(url) = std::env::var("THEORY_REMOTE_URL") {
        RemoteAdapter::new(context, Arc::new(StaticResolver::new(url)))
    } else {
        let program =
            std::env::var("THEORY_REMOTE_RESOLVER").unwrap_or_else(|_| "theory-resolve".into());
        RemoteAdapter::new(context, Arc::new(CommandResolver::new(program, Vec::new())))
    }
}

/// `theory run`. Returns the process exit code.
pub async fn cmd_run(config: &CliConfig, args: RunArgs) -> Result<i32> {
    let tool_ref: ToolRef = args
        .tool_ref
        .parse()
        .with_context(|| format!("bad --ref {:?}", args.tool_ref))?;
    let inputs: Value = match (&args.inputs_json, &args.inputs_file) {
        (Some(raw), _) => serde_json::from_str(raw).context("--inputs-json did not parse")?,
        (None, Some(path)) => serde_json::from_slice(
            &std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        )
        .context("--inputs-file did not parse")?,
        (None, None) => json!({}),
    };

    let options = InvokeOptions {
        tool_ref,
        mode: parse_mode(&args.mode)?,
        inputs,
        lane: if args.build { Lane::Build } else { Lane::Pinned },
        stream: args.stream,
        timeout_s: args.timeout,
        execution_id: None,
        write_prefix: args.write_prefix.clone(),
        plan: args.plan.clone(),
        platform: args.platform.as_deref().map(parse_platform).transpose()?,
    };

    let orchestrator = orchestrator(config);
    let envelope = match args.adapter {
        AdapterArg::Local => {
            let adapter = local_adapter(config);
            run_with(&orchestrator, &adapter, options, args.json).await
        }
        AdapterArg::Remote => {
            let adapter = remote_adapter();
            run_with(&orchestrator, &adapter, options, args.json).await
        }
    };

    if !envelope.is_error() {
        if let Some(dir) = &args.save_dir {
            save_outputs(config, &envelope, dir, None).await?;
        } else if let Some(file) = &args.save_first {
            save_outputs(config, &envelope, Path::new("."), Some(file)).await?;
        }
    }

    if args.json {
        println!("{}", serde_json::to_string(&envelope)?);
    } else if envelope.is_error() {
        let error = envelope.error.as_ref();
        eprintln!(
            "error: {}: {}",
            error.map_or("ERR_RUNTIME", |e| e.code.as_str()),
            error.map_or("", |e| e.message.as_str()),
        );
    } else {
        println!(
            "ok: {} outputs, index at {}",
            envelope.outputs.as_ref().map_or(0, Vec::len),
            envelope.index_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(if envelope.is_error() { 1 } else { 0 })
}

async fn run_with(
    orchestrator: &Orchestrator,
    adapter: &dyn Adapter,
    options: InvokeOptions,
    json: bool,
) -> ExecutionEnvelope {
    let stream_mode = options.stream;
    match orchestrator.invoke(adapter, options).await {
        InvokeOutcome::Final(envelope) => envelope,
        InvokeOutcome::Stream(mut stream) => {
            let mut terminal = None;
            while let Some(frame) = stream.next().await {
                match frame {
                    WsFrame::RunResult(envelope) => terminal = Some(envelope),
                    other if stream_mode => {
                        if json {
                            if let Ok(line) = serde_json::to_string(&other) {
                                eprintln!("{line}");
                            }
                        } else if let WsFrame::Token { text } = other {
                            print!("{text}");
                        }
                    }
                    _ => {}
                }
            }
            if stream_mode && !json {
                println!();
            }
            terminal.unwrap_or_else(|| {
                ExecutionEnvelope::error(
                    String::new(),
                    theory_core::error::ErrorCode::ErrBadResponse,
                    "stream ended without a RunResult",
                )
            })
        }
    }
}

/// Download outputs listed by the envelope through presigned GETs.
async fn save_outputs(
    config: &CliConfig,
    envelope: &ExecutionEnvelope,
    dir: &Path,
    first_to: Option<&Path>,
) -> Result<()> {
    let presigner = Presigner::new(&config.store_endpoint, &config.store_secret);
    let client = reqwest::Client::new();
    let outputs = envelope.outputs.clone().unwrap_or_default();
    for (i, output) in outputs.iter().enumerate() {
        let key = output.path.trim_start_matches('/');
        let url = presigner
            .get_url(&config.bucket, key, Duration::from_secs(120))
            .context("presign download")?;
        let bytes = client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("download {}", output.path))?
            .bytes()
            .await?;
        let target = match first_to {
            Some(file) => file.to_path_buf(),
            None => {
                let rel = output
                    .path
                    .rsplit("outputs/")
                    .next()
                    .unwrap_or("output.bin");
                dir.join(rel)
            }
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &bytes)
            .with_context(|| format!("write {}", target.display()))?;
        if first_to.is_some() && i == 0 {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local container control
// ---------------------------------------------------------------------------

fn print_envelope(value: &Value) {
    println!("{}", serde_json::to_string(value).unwrap_or_else(|_| "{}".into()));
}

/// `theory start --ref … --platform …`.
pub async fn cmd_start(
    config: &CliConfig,
    tool_ref: &str,
    platform: &str,
    port: Option<u16>,
) -> Result<i32> {
    let tool_ref: ToolRef = tool_ref.parse()?;
    let platform = parse_platform(platform)?;
    let registry = Registry::new(&config.registry_dir);
    let spec = registry.load(&tool_ref)?;
    let Some(image_ref) = spec.image_ref(platform).map(String::from) else {
        bail!("no image declared for platform {platform}");
    };

    let adapter = local_adapter(config);
    let mut env = std::collections::BTreeMap::new();
    let digest = adapter.resolve_image_digest(&image_ref, None).await;
    env.insert("IMAGE_DIGEST".to_string(), digest);
    env.insert("TZ".to_string(), "UTC".to_string());
    env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());

    match adapter.start(&tool_ref, &image_ref, &env, port).await {
        Ok(result) => {
            print_envelope(&json!({
                "ok": true,
                "ref": tool_ref.to_string(),
                "name": result.name,
                "port": result.port,
                "reused": result.reused,
                "url": format!("ws://127.0.0.1:{}/run", result.port),
            }));
            Ok(0)
        }
        Err(err) => {
            print_envelope(&json!({"ok": false, "error": err.to_string()}));
            Ok(1)
        }
    }
}

/// `theory stop {--ref … | --all}`.
pub async fn cmd_stop(config: &CliConfig, tool_ref: Option<&str>, all: bool) -> Result<i32> {
    let parsed: Option<ToolRef> = tool_ref.map(str::parse).transpose()?;
    let adapter = local_adapter(config);
    let removed = adapter.stop(parsed.as_ref(), all).await?;
    print_envelope(&json!({
        "ok": true,
        "stopped": removed.iter().map(|c| &c.name).collect::<Vec<_>>(),
    }));
    Ok(0)
}

/// `theory status [--ref …]`.
pub async fn cmd_status(config: &CliConfig, tool_ref: Option<&str>) -> Result<i32> {
    let adapter = local_adapter(config);
    let containers = match tool_ref {
        Some(raw) => adapter.find_by_ref(&raw.parse()?).await?,
        None => adapter.find_all().await?,
    };
    print_envelope(&json!({"ok": true, "containers": containers}));
    Ok(0)
}

/// `theory url --ref …`.
pub fn cmd_url(config: &CliConfig, tool_ref: &str) -> Result<i32> {
    let tool_ref: ToolRef = tool_ref.parse()?;
    let adapter = local_adapter(config);
    match adapter.recorded_port(&tool_ref) {
        Some(port) => {
            print_envelope(&json!({
                "ok": true,
                "url": format!("ws://127.0.0.1:{port}/run"),
                "healthz": format!("http://127.0.0.1:{port}/healthz"),
            }));
            Ok(0)
        }
        None => {
            print_envelope(&json!({"ok": false, "error": format!("no port recorded for {tool_ref}")}));
            Ok(1)
        }
    }
}

/// `theory logs --ref … [-f] [--tail N]`.
pub async fn cmd_logs(
    config: &CliConfig,
    tool_ref: &str,
    follow: bool,
    tail: u32,
) -> Result<i32> {
    let tool_ref: ToolRef = tool_ref.parse()?;
    let adapter = local_adapter(config);
    if follow {
        adapter.logs_follow(&tool_ref, tail).await?;
        return Ok(0);
    }
    let logs = adapter.logs(&tool_ref, tail).await?;
    print_envelope(&json!({"ok": true, "logs": logs}));
    Ok(0)
}
