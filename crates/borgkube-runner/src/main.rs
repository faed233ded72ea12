//! Backup runner entry point.
//!
//! Runs inside the ephemeral runner pod as PID 1, reading its configuration
//! from the secret the backup controller mounted at /config.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use borgkube_common::runner_config::{RunnerConfig, CONFIG_KEY};
use borgkube_common::RUNNER_CONFIG_MOUNT;

mod backup;
mod borg;
mod cache;
mod heartbeat;
mod list;
mod ssh;

/// Single-volume repository worker
#[derive(Parser, Debug)]
#[command(name = "borgkube-runner", version, about, long_about = None)]
struct Cli {
    /// Path to the mounted runner config
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create one archive and prune (default)
    Backup,
    /// List archives under this volume's prefix
    List,
}

fn default_config_path() -> PathBuf {
    PathBuf::from(RUNNER_CONFIG_MOUNT).join(CONFIG_KEY)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(default_config_path);

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot read runner config");
            return ExitCode::from(1);
        }
    };
    let cfg = match RunnerConfig::from_yaml(&raw) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid runner config");
            return ExitCode::from(1);
        }
    };

    let code = match cli.command.unwrap_or(Command::Backup) {
        Command::Backup => backup::run(cfg).await,
        Command::List => list::run(cfg).await,
    };
    ExitCode::from(code as u8)
}
