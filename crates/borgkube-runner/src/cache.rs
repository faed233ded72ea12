//! Cache-the-cache acceleration.
//!
//! The borg cache lives on the mounted cache PVC. Network-backed PVCs make
//! the cache's many small reads slow; when enabled, the runner rsyncs the
//! cache to a pod-local ephemeral path on start, points borg at it, and
//! rsyncs it back on exit. The cache PVC must be ReadWriteOncePod so two
//! runners can never write the cache concurrently.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use borgkube_common::{Error, Result, RUNNER_CACHE_MOUNT};

/// Pod-local ephemeral cache path.
pub const LOCAL_CACHE_DIR: &str = "/tmp/borg-cache";

/// rsync argument vector. Trailing slashes make rsync copy directory
/// contents rather than the directory itself.
pub fn rsync_args(src: &Path, dst: &Path, verbose: bool) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "--delete".to_string()];
    if verbose {
        args.push("-v".to_string());
    } else {
        args.push("--stats".to_string());
    }
    args.push(format!("{}/", src.display()));
    args.push(format!("{}/", dst.display()));
    args
}

async fn run_rsync(src: &Path, dst: &Path, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(dst)
        .map_err(|e| Error::execution("rsync", format!("create {}: {e}", dst.display())))?;

    let args = rsync_args(src, dst, verbose);
    info!(src = %src.display(), dst = %dst.display(), "rsyncing cache");

    let mut child = Command::new("rsync")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::execution("rsync", format!("spawn: {e}")))?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                info!("[rsync] {line}");
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::execution("rsync", format!("wait: {e}")))?;
    if !status.success() {
        return Err(Error::execution(
            "rsync",
            format!("exited {}", status.code().unwrap_or(-1)),
        ));
    }
    Ok(())
}

/// Copy cache PVC -> local cache before the backup. Failure aborts the run.
pub async fn rsync_in() -> Result<()> {
    run_rsync(Path::new(RUNNER_CACHE_MOUNT), Path::new(LOCAL_CACHE_DIR), false).await
}

/// Copy local cache -> cache PVC after the backup. Summary stats on the
/// normal path, verbose during signal-driven shutdown.
pub async fn rsync_out(verbose: bool) -> Result<()> {
    run_rsync(Path::new(LOCAL_CACHE_DIR), Path::new(RUNNER_CACHE_MOUNT), verbose).await
}
