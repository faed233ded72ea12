//! The list operation: enumerate archives under this volume's prefix.
//!
//! This is the restore primitive: it tells an operator which archives
//! exist without touching them. Output is one `name  time` line per
//! archive, oldest first, as borg reports them.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info};

use borgkube_common::runner_config::RunnerConfig;
use borgkube_common::RUNNER_CACHE_MOUNT;

use crate::borg;
use crate::ssh;

/// Borg's `list --json` payload, reduced to what gets printed.
#[derive(Debug, Deserialize)]
pub struct ListOutput {
    #[serde(default)]
    pub archives: Vec<ArchiveEntry>,
}

/// One archive row.
#[derive(Debug, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub time: String,
}

/// Parse borg's JSON list output.
pub fn parse_list(raw: &str) -> Result<ListOutput, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Run the list operation; returns the process exit code.
pub async fn run(cfg: RunnerConfig) -> i32 {
    let key_path = match ssh::write_ssh_key(&cfg.ssh_key, Path::new(ssh::SSH_KEY_PATH)) {
        Ok(path) => path,
        Err(e) => {
            error!(error = %e, "ssh key setup failed");
            return 1;
        }
    };
    let env = ssh::borg_env(&cfg, &key_path, Path::new(RUNNER_CACHE_MOUNT));

    let mut cmd = Command::new("borg");
    cmd.args(borg::list_args(&cfg))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    for (k, v) in &env {
        cmd.env(k, v);
    }

    let bound = Duration::from_secs(cfg.timeout_seconds);
    let output = match tokio::time::timeout(bound, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            error!(error = %e, "borg list failed to run");
            return 1;
        }
        Err(_) => {
            error!(seconds = cfg.timeout_seconds, "borg list timed out");
            return 1;
        }
    };

    if !output.status.success() {
        error!(code = output.status.code(), "borg list failed");
        return output.status.code().unwrap_or(1);
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let list = match parse_list(&raw) {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "cannot parse borg list output");
            return 1;
        }
    };

    info!(prefix = %cfg.archive_prefix, count = list.archives.len(), "archives");
    for archive in &list.archives {
        println!("{}  {}", archive.name, archive.time);
    }
    0
}
