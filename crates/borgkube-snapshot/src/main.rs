//! Snapshot controller entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use borgkube_common::config::AppConfig;
use borgkube_common::kube_client::create_client;

mod controller;

/// Create application-consistent VolumeSnapshots of configured PVCs
#[derive(Parser, Debug)]
#[command(name = "borgkube-snapshot", version, about, long_about = None)]
struct Cli {
    /// Path to the config file (falls back to $APP_CONFIG, then
    /// /config/config.yaml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Explicit kubeconfig path when in-cluster detection fails
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let cfg = match AppConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let client = match create_client(cli.kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to create Kubernetes client");
            return ExitCode::from(3);
        }
    };

    match controller::run(cfg, client).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "snapshot controller failed");
            ExitCode::from(1)
        }
    }
}
