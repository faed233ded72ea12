//! The backup operation: one archive create, optional prune, cache
//! shuttling, and checkpoint-on-termination.
//!
//! The runner is PID 1 in its pod. On SIGTERM/SIGINT it forwards SIGINT to
//! the borg child so borg writes a checkpoint, waits up to 10 s, then
//! SIGKILLs the child and clears the lease with `break-lock`, exiting 143.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use borgkube_common::names;
use borgkube_common::runner_config::RunnerConfig;
use borgkube_common::{Result, EXIT_TERMINATED, RUNNER_CACHE_MOUNT, RUNNER_DATA_MOUNT};

use crate::borg::{self, BorgExit, LockState, SHORT_COMMAND_TIMEOUT};
use crate::cache;
use crate::heartbeat;
use crate::ssh;

/// How long the child gets to checkpoint after SIGINT.
const CHECKPOINT_WAIT: Duration = Duration::from_secs(10);

/// SIGTERM/SIGINT listener for the runner process.
struct TermSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

impl TermSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

/// Outcome of one guarded borg invocation.
enum Guarded {
    Exited(BorgExit),
    Signalled,
}

/// Run the backup operation; returns the process exit code.
pub async fn run(cfg: RunnerConfig) -> i32 {
    let mut signals = match TermSignals::new() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "cannot install signal handlers");
            return 1;
        }
    };

    let key_path = match ssh::write_ssh_key(&cfg.ssh_key, Path::new(ssh::SSH_KEY_PATH)) {
        Ok(path) => path,
        Err(e) => {
            error!(error = %e, "ssh key setup failed");
            return 1;
        }
    };

    // Cache-the-cache: local copy first; a failed copy-in aborts the run.
    let cache_dir = if cfg.cache_the_cache {
        if let Err(e) = cache::rsync_in().await {
            error!(error = %e, "cache copy-in failed");
            return 1;
        }
        Path::new(cache::LOCAL_CACHE_DIR)
    } else {
        Path::new(RUNNER_CACHE_MOUNT)
    };
    let env = ssh::borg_env(&cfg, &key_path, cache_dir);

    info!(prefix = %cfg.archive_prefix, lock_wait = cfg.timeout_seconds, "starting backup");

    // Pre-flight: probe the repository lock. Informational only.
    match borg::run_short(&borg::with_lock_args(&cfg.repo), &env, SHORT_COMMAND_TIMEOUT).await {
        Ok((exit, timed_out)) => {
            let state = borg::classify_lock(
                exit.as_ref().and_then(|e| e.code),
                exit.as_ref().map(|e| e.stderr.as_str()).unwrap_or(""),
                timed_out,
            );
            info!(state = state.as_str(), "repository lock pre-flight");
            if state == LockState::Locked {
                info!("repository locked by another writer, create will wait");
            }
        }
        Err(e) => warn!(error = %e, "lock pre-flight failed to run"),
    }

    let archive = names::archive_name(&cfg.archive_prefix, Utc::now());
    info!(archive = %archive, data_dir = RUNNER_DATA_MOUNT, "creating archive");
    let create_args = borg::create_args(&cfg, &archive, RUNNER_DATA_MOUNT);

    let exit = match run_guarded(&create_args, &env, &cfg, &mut signals).await {
        Ok(Guarded::Exited(exit)) => exit,
        Ok(Guarded::Signalled) => return shutdown_after_signal(&cfg).await,
        Err(e) => {
            error!(error = %e, "borg create failed to run");
            return 1;
        }
    };

    // Exit 2 with the uninitialized-repo marker: init and retry exactly once.
    let exit = if borg::needs_init(exit.code, &exit.stderr) {
        info!("repository not initialized, running init");
        match borg::run_short(&borg::init_args(&cfg.repo), &env, SHORT_COMMAND_TIMEOUT).await {
            Ok((Some(init_exit), false)) if init_exit.success() => {
                info!("repository initialized, retrying create");
            }
            Ok((init_exit, timed_out)) => {
                error!(
                    code = init_exit.and_then(|e| e.code),
                    timed_out, "repository init failed"
                );
                return 1;
            }
            Err(e) => {
                error!(error = %e, "repository init failed to run");
                return 1;
            }
        }
        match run_guarded(&create_args, &env, &cfg, &mut signals).await {
            Ok(Guarded::Exited(exit)) => exit,
            Ok(Guarded::Signalled) => return shutdown_after_signal(&cfg).await,
            Err(e) => {
                error!(error = %e, "borg create retry failed to run");
                return 1;
            }
        }
    } else {
        exit
    };

    if !exit.success() {
        error!(code = exit.code, "borg create failed");
        copy_cache_back(&cfg, false).await;
        return exit.code.unwrap_or(1);
    }
    info!(archive = %archive, "archive created");

    // Retention pruning, scoped to this prefix, after a successful create.
    if !cfg.retention.is_empty() {
        info!(prefix = %cfg.archive_prefix, "pruning archives");
        match run_guarded(&borg::prune_args(&cfg), &env, &cfg, &mut signals).await {
            Ok(Guarded::Exited(exit)) if exit.success() => info!("prune complete"),
            Ok(Guarded::Exited(exit)) => {
                error!(code = exit.code, "prune failed");
                copy_cache_back(&cfg, false).await;
                return exit.code.unwrap_or(1);
            }
            Ok(Guarded::Signalled) => return shutdown_after_signal(&cfg).await,
            Err(e) => {
                error!(error = %e, "prune failed to run");
                copy_cache_back(&cfg, false).await;
                return 1;
            }
        }
    } else {
        info!("retention empty, skipping prune");
    }

    if cfg.cache_the_cache {
        if let Err(e) = cache::rsync_out(false).await {
            error!(error = %e, "cache copy-out failed");
            return 1;
        }
    }

    info!("backup successful");
    0
}

/// Run one borg invocation with the heartbeat attached, racing termination
/// signals.
async fn run_guarded(
    args: &[String],
    env: &[(String, String)],
    cfg: &RunnerConfig,
    signals: &mut TermSignals,
) -> Result<Guarded> {
    let mut spawned = borg::spawn(args, env)?;
    info!(pid = spawned.pid(), "borg child started");

    let hb_cancel = CancellationToken::new();
    let hb_task = spawned
        .pid()
        .map(|pid| tokio::spawn(heartbeat::heartbeat_loop(pid, hb_cancel.clone())));

    // Race the child against the signal listener; the child handle is only
    // touched again after the select's borrow ends.
    enum Raced {
        Exited(std::io::Result<std::process::ExitStatus>),
        Signalled(&'static str),
    }
    let raced = tokio::select! {
        status = spawned.child.wait() => Raced::Exited(status),
        name = signals.recv() => Raced::Signalled(name),
    };

    let outcome = match raced {
        Raced::Exited(Ok(status)) => {
            let code = status.code();
            let stderr = spawned.collect_stderr().await;
            Ok(Guarded::Exited(BorgExit { code, stderr }))
        }
        Raced::Exited(Err(e)) => Err(borgkube_common::Error::execution(
            "borg",
            format!("wait: {e}"),
        )),
        Raced::Signalled(name) => {
            warn!(signal = name, "termination signal received");
            graceful_stop(&mut spawned.child, &cfg.repo, env).await;
            Ok(Guarded::Signalled)
        }
    };

    hb_cancel.cancel();
    if let Some(task) = hb_task {
        let _ = task.await;
    }
    outcome
}

/// SIGINT the child for a checkpoint; SIGKILL and break the lock if the
/// checkpoint does not land in time.
async fn graceful_stop(child: &mut Child, repo: &str, env: &[(String, String)]) {
    let Some(pid) = child.id() else {
        return; // already exited
    };

    info!(pid, "forwarding SIGINT to borg (checkpoint + abort)");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(pid, error = %e, "failed to forward SIGINT");
    }

    match tokio::time::timeout(CHECKPOINT_WAIT, child.wait()).await {
        Ok(_) => info!("borg stopped after checkpoint"),
        Err(_) => {
            warn!("checkpoint incomplete after {}s, killing borg", CHECKPOINT_WAIT.as_secs());
            let _ = child.start_kill();
            let _ = child.wait().await;

            info!("breaking stale repository lock");
            match borg::run_short(&borg::break_lock_args(repo), env, SHORT_COMMAND_TIMEOUT).await {
                Ok((Some(exit), false)) if exit.success() => info!("lock cleared"),
                Ok(_) => warn!("break-lock did not complete cleanly"),
                Err(e) => warn!(error = %e, "break-lock failed to run"),
            }
        }
    }
}

/// Verbose cache copy-back on the signal path, then 143.
async fn shutdown_after_signal(cfg: &RunnerConfig) -> i32 {
    if cfg.cache_the_cache {
        if let Err(e) = cache::rsync_out(true).await {
            error!(error = %e, "cache copy-out failed during shutdown");
        }
    }
    EXIT_TERMINATED
}

/// Non-fatal cache copy-back on failure paths; the original error wins.
async fn copy_cache_back(cfg: &RunnerConfig, verbose: bool) {
    if cfg.cache_the_cache {
        if let Err(e) = cache::rsync_out(verbose).await {
            error!(error = %e, "cache copy-out failed");
        }
    }
}
