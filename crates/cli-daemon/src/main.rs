//! CLI entry point for vidrelay
//!
//! Parses command line arguments, initializes logging and starts the daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vidrelay::{Config, Daemon, DaemonError};

/// vidrelay - compress uploaded videos under the chat size limit and post them
#[derive(Parser, Debug)]
#[command(name = "vidrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); a missing file means defaults
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Directory holding per-job workspaces (overrides the config file)
    #[arg(short, long)]
    workspace_root: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe, encoder discovery)
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vidrelay=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn start(args: Args) -> Result<(), DaemonError> {
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(root) = args.workspace_root {
        config.workspace.root = root;
    }
    info!(
        config = %args.config.display(),
        workspace_root = %config.workspace.root.display(),
        "vidrelay starting"
    );
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks)");
    }

    let daemon = Daemon::new(config, args.skip_checks).await?;
    daemon.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match start(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "vidrelay stopped");
            ExitCode::FAILURE
        }
    }
}
