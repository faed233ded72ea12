//! Borg invocation: argument construction, exit classification, and
//! subprocess plumbing.
//!
//! The repository tool's contract: exit 0 success; exit 2 with
//! "is not a valid repository" means uninitialized; exit 2 with
//! "Failed to create/acquire the lock" means locked; SIGINT during create
//! causes checkpoint + abort.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::info;

use borgkube_common::config::Retention;
use borgkube_common::runner_config::RunnerConfig;
use borgkube_common::{Error, Result};

/// Stderr substring marking an uninitialized repository.
pub const NOT_A_REPO: &str = "is not a valid repository";

/// Stderr substring marking a held repository lock.
pub const LOCK_FAILED: &str = "Failed to create/acquire the lock";

/// Exit code borg uses for both conditions above.
pub const EXIT_REPO_ERROR: i32 = 2;

/// Bound on the preflight and other short commands.
pub const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Repository lock state observed by the preflight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    Timeout,
    Error,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "unlocked",
            LockState::Locked => "locked",
            LockState::Timeout => "timeout",
            LockState::Error => "error",
        }
    }
}

/// Classify the preflight result.
pub fn classify_lock(exit_code: Option<i32>, stderr: &str, timed_out: bool) -> LockState {
    if timed_out {
        return LockState::Timeout;
    }
    match exit_code {
        Some(0) => LockState::Unlocked,
        Some(EXIT_REPO_ERROR) if stderr.contains(LOCK_FAILED) => LockState::Locked,
        _ => LockState::Error,
    }
}

/// Whether a create failure means the repository needs `init` first.
pub fn needs_init(exit_code: Option<i32>, stderr: &str) -> bool {
    exit_code == Some(EXIT_REPO_ERROR) && stderr.contains(NOT_A_REPO)
}

/// `borg with-lock --lock-wait 0 <repo> true`: probes the lock without
/// holding it longer than a no-op.
pub fn with_lock_args(repo: &str) -> Vec<String> {
    vec![
        "with-lock".into(),
        "--lock-wait".into(),
        "0".into(),
        repo.into(),
        "true".into(),
    ]
}

/// `borg create` arguments for one archive.
pub fn create_args(cfg: &RunnerConfig, archive: &str, data_dir: &str) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--lock-wait".to_string(),
        cfg.timeout_seconds.to_string(),
    ];
    args.extend(cfg.effective_flags());
    args.push(format!("{}::{}", cfg.repo, archive));
    args.push(data_dir.to_string());
    args
}

/// `borg init --encryption repokey-blake2 <repo>`.
pub fn init_args(repo: &str) -> Vec<String> {
    vec![
        "init".into(),
        "--encryption".into(),
        "repokey-blake2".into(),
        repo.into(),
    ]
}

/// `borg prune` arguments from the retention policy, scoped to the archive
/// prefix. Every invocation carries `--glob-archives {prefix}-*` so that
/// applications sharing a repository never prune each other's archives.
pub fn prune_args(cfg: &RunnerConfig) -> Vec<String> {
    let mut args = vec![
        "prune".to_string(),
        "--lock-wait".to_string(),
        cfg.timeout_seconds.to_string(),
        "--list".to_string(),
    ];
    args.extend(retention_flags(&cfg.retention));
    args.push(format!("--glob-archives={}-*", cfg.archive_prefix));
    args.push(cfg.repo.clone());
    args
}

/// `--keep-*` flags for the non-zero retention tiers.
pub fn retention_flags(retention: &Retention) -> Vec<String> {
    let tiers = [
        ("--keep-hourly", retention.hourly),
        ("--keep-daily", retention.daily),
        ("--keep-weekly", retention.weekly),
        ("--keep-monthly", retention.monthly),
    ];
    let mut flags = Vec::new();
    for (flag, count) in tiers {
        if count > 0 {
            flags.push(flag.to_string());
            flags.push(count.to_string());
        }
    }
    flags
}

/// `borg break-lock <repo>`.
pub fn break_lock_args(repo: &str) -> Vec<String> {
    vec!["break-lock".into(), repo.into()]
}

/// `borg list --json --glob-archives {prefix}-* <repo>`.
pub fn list_args(cfg: &RunnerConfig) -> Vec<String> {
    vec![
        "list".into(),
        "--json".into(),
        format!("--glob-archives={}-*", cfg.archive_prefix),
        cfg.repo.clone(),
    ]
}

/// A spawned borg child with its stderr tee task.
pub struct BorgChild {
    pub child: Child,
    stderr_task: JoinHandle<String>,
}

/// Result of a completed borg invocation.
#[derive(Debug)]
pub struct BorgExit {
    pub code: Option<i32>,
    pub stderr: String,
}

impl BorgExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Spawn borg with stdout inherited and stderr teed: every line is logged
/// as it arrives and kept for exit classification.
pub fn spawn(args: &[String], envs: &[(String, String)]) -> Result<BorgChild> {
    let mut cmd = Command::new("borg");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::execution("borg", format!("spawn borg {:?}: {e}", args.first())))?;

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut captured = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[borg] {line}");
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        captured
    });

    Ok(BorgChild { child, stderr_task })
}

impl BorgChild {
    /// Process id while the child is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Collect the teed stderr once the child has exited.
    pub async fn collect_stderr(self) -> String {
        self.stderr_task.await.unwrap_or_default()
    }
}

/// Run a short borg command to completion with a bound. Returns the exit
/// plus whether the bound elapsed (the child is killed in that case).
pub async fn run_short(
    args: &[String],
    envs: &[(String, String)],
    bound: Duration,
) -> Result<(Option<BorgExit>, bool)> {
    let mut spawned = spawn(args, envs)?;
    match tokio::time::timeout(bound, spawned.child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| Error::execution("borg", format!("wait: {e}")))?;
            let stderr = spawned.stderr_task.await.unwrap_or_default();
            Ok((
                Some(BorgExit {
                    code: status.code(),
                    stderr,
                }),
                false,
            ))
        }
        Err(_) => {
            let _ = spawned.child.start_kill();
            let _ = spawned.child.wait().await;
            spawned.stderr_task.abort();
            Ok((None, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RunnerConfig {
        RunnerConfig {
            repo: "ssh://borg@host/./repo".into(),
            passphrase: "p".into(),
            ssh_key: "k".into(),
            archive_prefix: "myapp-data".into(),
            timeout_seconds: 3600,
            borg_flags: vec![],
            retention: Retention {
                hourly: 24,
                daily: 7,
                weekly: 0,
                monthly: 6,
            },
            cache_the_cache: false,
        }
    }

    #[test]
    fn lock_classification() {
        assert_eq!(classify_lock(Some(0), "", false), LockState::Unlocked);
        assert_eq!(
            classify_lock(Some(2), "Failed to create/acquire the lock (timeout)", false),
            LockState::Locked
        );
        assert_eq!(classify_lock(None, "", true), LockState::Timeout);
        assert_eq!(classify_lock(Some(2), "some other failure", false), LockState::Error);
        assert_eq!(classify_lock(Some(1), "", false), LockState::Error);
    }

    #[test]
    fn init_detection_requires_code_and_substring() {
        assert!(needs_init(Some(2), "repo is not a valid repository"));
        assert!(!needs_init(Some(1), "repo is not a valid repository"));
        assert!(!needs_init(Some(2), "lock held"));
        assert!(!needs_init(None, "repo is not a valid repository"));
    }

    #[test]
    fn create_args_default_stats() {
        let args = create_args(&cfg(), "myapp-data-2026-02-03-04-05-06", "/data");
        assert_eq!(
            args,
            vec![
                "create",
                "--lock-wait",
                "3600",
                "--stats",
                "ssh://borg@host/./repo::myapp-data-2026-02-03-04-05-06",
                "/data",
            ]
        );
    }

    #[test]
    fn create_args_honor_overrides() {
        let mut c = cfg();
        c.borg_flags = vec!["--stats".into(), "--compression".into(), "zstd".into()];
        let args = create_args(&c, "a", "/data");
        assert!(args.contains(&"--compression".to_string()));
        assert!(args.contains(&"zstd".to_string()));
    }

    #[test]
    fn prune_always_scoped_by_glob() {
        let args = prune_args(&cfg());
        assert!(args.contains(&"--glob-archives=myapp-data-*".to_string()));
        // Zero tiers are omitted, non-zero tiers present.
        assert!(args.contains(&"--keep-hourly".to_string()));
        assert!(args.contains(&"--keep-daily".to_string()));
        assert!(!args.contains(&"--keep-weekly".to_string()));
        assert!(args.contains(&"--keep-monthly".to_string()));
        assert_eq!(args.last().unwrap(), "ssh://borg@host/./repo");
    }

    #[test]
    fn retention_flags_order_and_values() {
        let flags = retention_flags(&Retention {
            hourly: 1,
            daily: 0,
            weekly: 2,
            monthly: 0,
        });
        assert_eq!(flags, vec!["--keep-hourly", "1", "--keep-weekly", "2"]);
    }

    #[test]
    fn with_lock_probes_without_waiting() {
        let args = with_lock_args("repo");
        assert_eq!(args, vec!["with-lock", "--lock-wait", "0", "repo", "true"]);
    }

    #[test]
    fn list_args_scope_by_prefix() {
        let args = list_args(&cfg());
        assert!(args.contains(&"--json".to_string()));
        assert!(args.contains(&"--glob-archives=myapp-data-*".to_string()));
    }
}
