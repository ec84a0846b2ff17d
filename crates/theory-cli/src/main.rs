// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use clap::{Parser, Subcommand};
use theory_cli::commands::{self, RunArgs};
use theory_cli::config::CliConfig;

/// Exit code for runtime errors (error envelopes included).
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "theory", version, about = "Theory execution plane CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a tool and print its envelope.
    Run(RunArgs),

    /// Start (or reuse) the local container for a tool ref.
    Start {
        /// Tool ref (`ns/name@ver`).
        #[arg(long = "ref")]
        tool_ref: String,
        /// Image platform (`amd64` or `arm64`).
        #[arg(long)]
        platform: String,
        /// Host port override.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop local containers.
    Stop {
        /// Tool ref to stop.
        #[arg(long = "ref", conflicts_with = "all")]
        tool_ref: Option<String>,
        /// Stop every managed container.
        #[arg(long)]
        all: bool,
    },

    /// Show managed containers.
    Status {
        /// Restrict to one tool ref.
        #[arg(long = "ref")]
        tool_ref: Option<String>,
    },

    /// Print the recorded run URL for a tool ref.
    Url {
        /// Tool ref.
        #[arg(long = "ref")]
        tool_ref: String,
    },

    /// Show container logs.
    Logs {
        /// Tool ref.
        #[arg(long = "ref")]
        tool_ref: String,
        /// Follow the log stream.
        #[arg(short = 'f', long)]
        follow: bool,
        /// Number of trailing lines.
        #[arg(long, default_value_t = 100)]
        tail: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.debug {
        theory_telemetry::init_with_filter(theory_telemetry::LogFormat::Pretty, "debug");
    } else {
        theory_telemetry::init_from_env();
    }
    let config = CliConfig::from_env();

    let result = match cli.command {
        Commands::Run(args) => commands::cmd_run(&config, args).await,
        Commands::Start {
            tool_ref,
            platform,
            port,
        } => commands::cmd_start(&config, &tool_ref, &platform, port).await,
        Commands::Stop { tool_ref, all } => {
            commands::cmd_stop(&config, tool_ref.as_deref(), all).await
        }
        Commands::Status { tool_ref } => {
            commands::cmd_status(&config, tool_ref.as_deref()).await
        }
        Commands::Url { tool_ref } => commands::cmd_url(&config, &tool_ref),
        Commands::Logs {
            tool_ref,
            follow,
            tail,
        } => commands::cmd_logs(&config, &tool_ref, follow, tail).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}
