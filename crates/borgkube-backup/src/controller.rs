//! Backup controller run loop.
//!
//! Phase 1 provisions clone PVCs for every spec in parallel; phase 2 walks
//! the specs strictly sequentially, because the repository only supports a
//! single writer. Every short-lived resource is registered in the tracked
//! registry before its create call, and the registry is drained on every
//! exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use borgkube_common::config::{AppConfig, BackupSection, BackupSpec};
use borgkube_common::hooks::HookExecutor;
use borgkube_common::kube_client::{create_idempotent, delete_idempotent, ClusterClient};
use borgkube_common::pod_monitor::{PodMonitor, PodOutcome};
use borgkube_common::report::RunReport;
use borgkube_common::runner_config::RunnerConfig;
use borgkube_common::signals::install_termination_handler;
use borgkube_common::snapshots::{SnapshotClient, SnapshotRef};
use borgkube_common::tracked::{delete_and_confirm, ResourceKind, TrackedResources};
use borgkube_common::{names, Error, Result, EXIT_TERMINATED};

use crate::clone::{self, BindingMode, DEFAULT_CLONE_SIZE};
use crate::runner_pod::{self, RunnerPodParams, RUNNER_CONTAINER};
use crate::volume;

/// Slack added to the pod's own activeDeadline before the controller gives
/// up waiting on it (covers scheduling and image pull before start).
const MONITOR_SLACK: Duration = Duration::from_secs(300);

/// Run options beyond the config bundle.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Local-development short circuit: provision clones but skip the
    /// runner pod, simulating the transfer.
    pub test_mode: bool,
}

/// Per-spec result of phase 1.
enum ProvisionState {
    Requested { clone_name: String, snapshot: SnapshotRef },
    Failed(String),
}

/// Storage class facts needed per backup spec.
#[derive(Clone, Debug)]
struct StorageClassInfo {
    mode: BindingMode,
    provisioner: String,
}

/// Execute one backup run; returns the process exit code.
pub async fn run(cfg: AppConfig, client: Client, opts: RunOptions) -> Result<i32> {
    let backup = cfg
        .backup
        .clone()
        .ok_or_else(|| Error::config_field("backup", "backup section is required"))?;

    let cancel = install_termination_handler()?;
    let controller = BackupController {
        cluster: ClusterClient::new(client.clone(), &cfg.namespace),
        snapshots: SnapshotClient::new(&client, &cfg.namespace),
        hooks: HookExecutor::new(&client, &cfg.namespace),
        tracked: Arc::new(TrackedResources::new()),
        cfg,
        backup,
        cancel,
        opts,
    };

    let result = controller.run_inner().await;

    // The registry is drained on every exit path, including fatal errors.
    let leaked = controller.tracked.drain(controller.cluster.client()).await;
    if leaked > 0 {
        warn!(leaked, "some tracked resources could not be reclaimed");
    }

    match result {
        Ok(report) => {
            println!("{}", report.render());
            Ok(report.exit_code())
        }
        Err(Error::Cancelled) => Ok(EXIT_TERMINATED),
        Err(e) => Err(e),
    }
}

struct BackupController {
    cfg: AppConfig,
    backup: BackupSection,
    cluster: ClusterClient,
    snapshots: SnapshotClient,
    hooks: HookExecutor,
    tracked: Arc<TrackedResources>,
    cancel: CancellationToken,
    opts: RunOptions,
}

impl BackupController {
    async fn run_inner(&self) -> Result<RunReport> {
        info!(
            namespace = %self.cfg.namespace,
            specs = self.backup.volumes.len(),
            test_mode = self.opts.test_mode,
            "backup run starting"
        );

        let classes = self.verify_storage_classes().await?;
        let mut states = self.provision_clones().await;

        let mut report = RunReport::new();
        for (i, spec) in self.backup.volumes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.not_started(&spec.name, "run cancelled");
                continue;
            }
            match states[i].take() {
                Some(ProvisionState::Requested { clone_name, snapshot }) => {
                    info!(backup = %spec.name, snapshot = %snapshot.name, clone = %clone_name, "starting backup");
                    let sc = &classes[&spec.clone_storage_class];
                    match self.process_spec(spec, &clone_name, sc).await {
                        Ok(()) => {
                            info!(backup = %spec.name, "backup succeeded");
                            report.succeeded(&spec.name);
                        }
                        Err(Error::Cancelled) => {
                            report.failed(&spec.name, "interrupted by termination signal");
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            error!(backup = %spec.name, error = %e, "backup failed");
                            report.failed(&spec.name, e.to_string());
                        }
                    }
                }
                Some(ProvisionState::Failed(reason)) => {
                    error!(backup = %spec.name, reason = %reason, "skipping backup");
                    report.failed(&spec.name, reason);
                }
                None => report.not_started(&spec.name, "run cancelled"),
            }
        }

        if self.cancel.is_cancelled() {
            report.mark_cancelled();
        }
        Ok(report)
    }

    /// Verify every referenced clone storage class exists; one read per
    /// distinct class. Missing classes fail startup with the class name.
    async fn verify_storage_classes(&self) -> Result<HashMap<String, StorageClassInfo>> {
        let mut classes = HashMap::new();
        for spec in &self.backup.volumes {
            if classes.contains_key(&spec.clone_storage_class) {
                continue;
            }
            let sc = self
                .cluster
                .storage_class(&spec.clone_storage_class)
                .await?
                .ok_or_else(|| {
                    Error::config(format!(
                        "clone storage class '{}' does not exist",
                        spec.clone_storage_class
                    ))
                })?;
            classes.insert(
                spec.clone_storage_class.clone(),
                StorageClassInfo {
                    mode: clone::binding_mode(&sc),
                    provisioner: sc.provisioner.clone(),
                },
            );
        }
        Ok(classes)
    }

    /// Phase 1: pick the newest ready snapshot per spec and request all
    /// clone PVCs concurrently, without waiting for readiness.
    async fn provision_clones(&self) -> Vec<Option<ProvisionState>> {
        let mut states: Vec<Option<ProvisionState>> =
            (0..self.backup.volumes.len()).map(|_| None).collect();

        let mut tasks: JoinSet<(usize, ProvisionState)> = JoinSet::new();
        for (i, spec) in self.backup.volumes.iter().enumerate() {
            let spec = spec.clone();
            let snapshots = self.snapshots.clone();
            let cluster = self.cluster.clone();
            let tracked = self.tracked.clone();
            let release_name = self.cfg.release_name.clone();
            tasks.spawn(async move {
                let state =
                    provision_one(&snapshots, &cluster, &tracked, &release_name, &spec).await;
                (i, state)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, state)) => states[i] = Some(state),
                Err(e) => warn!(error = %e, "clone provisioning task panicked"),
            }
        }
        states
    }

    /// Phase 2, one spec: hooks around the transfer, teardown afterwards.
    async fn process_spec(
        &self,
        spec: &BackupSpec,
        clone_name: &str,
        sc: &StorageClassInfo,
    ) -> Result<()> {
        let pod_name = names::runner_pod_name(&self.cfg.release_name, &spec.name, Utc::now());
        let secret_name = names::config_secret_name(&pod_name);

        // Pre-hooks guard the transfer; if they fail the transfer never
        // starts and the post-hooks are not owed.
        self.hooks.run_all(&spec.pre_hooks).await?;

        let result = self
            .transfer(spec, clone_name, sc, &pod_name, &secret_name)
            .await;

        // Post-hooks run exactly once per completed pre-hook sequence, even
        // when the transfer failed or a signal arrived.
        if let Err(e) = self.hooks.run_all(&spec.post_hooks).await {
            error!(backup = %spec.name, error = %e, "post-hooks failed");
        }

        self.teardown(clone_name, &pod_name, &secret_name).await;
        result
    }

    /// Clone wait, secret mint, pod spawn, monitor, classify.
    async fn transfer(
        &self,
        spec: &BackupSpec,
        clone_name: &str,
        sc: &StorageClassInfo,
        pod_name: &str,
        secret_name: &str,
    ) -> Result<()> {
        clone::wait_clone_ready(
            &self.cluster,
            clone_name,
            sc.mode,
            spec.clone_bind_timeout,
            &self.cancel,
        )
        .await?;

        if volume::needs_volume_wait(&sc.provisioner) {
            if let Some(pv_name) = self.bound_pv_name(clone_name).await? {
                volume::wait_volume_healthy(
                    self.cluster.client(),
                    &pv_name,
                    spec.clone_bind_timeout,
                    &self.cancel,
                )
                .await?;
            }
        }

        if self.opts.test_mode {
            info!(backup = %spec.name, "test mode: skipping runner pod spawn");
            tokio::time::sleep(Duration::from_secs(2)).await;
            return Ok(());
        }

        // Ephemeral secret, registered before creation.
        let runner_cfg = build_runner_config(&self.cfg, &self.backup, spec);
        let secret = runner_pod::build_runner_secret(secret_name, &self.cfg.namespace, &runner_cfg)?;
        self.tracked
            .register(ResourceKind::Secret, &self.cfg.namespace, secret_name);
        create_idempotent(&self.cluster.secrets(), &secret).await?;

        // Runner pod, registered before creation.
        let pod = runner_pod::build_runner_pod(&RunnerPodParams {
            pod_name,
            namespace: &self.cfg.namespace,
            backup_name: &spec.name,
            image: &self.backup.pod_image,
            clone_pvc: clone_name,
            cache_pvc: &self.backup.cache.pvc_name,
            config_secret: secret_name,
            privileged: self.backup.privileged,
            timeout_seconds: spec.timeout,
        });
        self.tracked
            .register(ResourceKind::Pod, &self.cfg.namespace, pod_name);
        create_idempotent(&self.cluster.pods(), &pod).await?;
        info!(backup = %spec.name, pod = %pod_name, "runner pod created");

        // The pod's activeDeadline bounds the transfer; the extra slack
        // covers scheduling and image pull before the clock starts.
        let monitor = PodMonitor::new(
            self.cluster.client().clone(),
            &self.cfg.namespace,
            pod_name,
            RUNNER_CONTAINER,
            self.cancel.clone(),
        );
        let wait = Duration::from_secs(spec.timeout) + MONITOR_SLACK;
        let outcome = match tokio::time::timeout(wait, monitor.watch_until_terminal()).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(Error::timeout(
                    format!("runner pod {pod_name}"),
                    wait.as_secs(),
                ))
            }
        };
        classify_outcome(&spec.name, &outcome)
    }

    /// PV bound to a clone PVC, if any yet.
    async fn bound_pv_name(&self, pvc_name: &str) -> Result<Option<String>> {
        let pvc = self.cluster.pvcs().get(pvc_name).await?;
        Ok(pvc.spec.and_then(|s| s.volume_name))
    }

    /// Delete clone PVC, runner pod and secret. The PVC delete is issued
    /// first but only completes once the pod releases the mount, so the
    /// confirming reads run pod-first. Failures stay registered for the
    /// final drain.
    async fn teardown(&self, clone_name: &str, pod_name: &str, secret_name: &str) {
        let ns = self.cfg.namespace.to_string();

        if let Err(e) = delete_idempotent(&self.cluster.pvcs(), clone_name).await {
            warn!(pvc = %clone_name, error = %e, "clone PVC delete failed");
        }

        match delete_and_confirm(&self.cluster.pods(), pod_name).await {
            Ok(()) => self.tracked.deregister(ResourceKind::Pod, &ns, pod_name),
            Err(e) => warn!(pod = %pod_name, error = %e, "runner pod teardown failed"),
        }
        match delete_and_confirm(&self.cluster.pvcs(), clone_name).await {
            Ok(()) => self
                .tracked
                .deregister(ResourceKind::PersistentVolumeClaim, &ns, clone_name),
            Err(e) => warn!(pvc = %clone_name, error = %e, "clone PVC teardown failed"),
        }
        match delete_and_confirm(&self.cluster.secrets(), secret_name).await {
            Ok(()) => self.tracked.deregister(ResourceKind::Secret, &ns, secret_name),
            Err(e) => warn!(secret = %secret_name, error = %e, "config secret teardown failed"),
        }
    }
}

/// Phase 1 worker: snapshot selection plus the clone create call.
async fn provision_one(
    snapshots: &SnapshotClient,
    cluster: &ClusterClient,
    tracked: &TrackedResources,
    release_name: &str,
    spec: &BackupSpec,
) -> ProvisionState {
    let snapshot = match snapshots.latest_ready(&spec.pvc).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return ProvisionState::Failed(format!("no ready snapshot for PVC '{}'", spec.pvc))
        }
        Err(e) => return ProvisionState::Failed(format!("snapshot lookup failed: {e}")),
    };

    let clone_name = names::clone_pvc_name(release_name, &spec.name, Utc::now());
    let size = snapshot
        .restore_size
        .clone()
        .unwrap_or_else(|| DEFAULT_CLONE_SIZE.to_string());
    let manifest = clone::build_clone_pvc(
        &clone_name,
        cluster.namespace(),
        &snapshot.name,
        &spec.clone_storage_class,
        &size,
    );

    tracked.register(
        ResourceKind::PersistentVolumeClaim,
        cluster.namespace(),
        &clone_name,
    );
    match create_idempotent(&cluster.pvcs(), &manifest).await {
        Ok(()) => {
            info!(backup = %spec.name, clone = %clone_name, snapshot = %snapshot.name, "clone PVC requested");
            ProvisionState::Requested { clone_name, snapshot }
        }
        Err(e) => ProvisionState::Failed(format!("clone create failed: {e}")),
    }
}

/// Secret payload for one spec.
fn build_runner_config(cfg: &AppConfig, backup: &BackupSection, spec: &BackupSpec) -> RunnerConfig {
    RunnerConfig {
        repo: backup.repo.endpoint.clone(),
        passphrase: backup.repo.passphrase.clone(),
        ssh_key: backup.repo.ssh_key.clone(),
        archive_prefix: cfg.backup_archive_prefix(spec),
        timeout_seconds: spec.timeout,
        borg_flags: spec.borg_flags.clone().unwrap_or_default(),
        retention: backup.retention,
        cache_the_cache: backup.cache.cache_the_cache,
    }
}

/// Map a terminal pod outcome to the volume's result. Exit 143 (SIGTERM
/// inside the pod) fails this volume but does not change loop policy.
fn classify_outcome(backup_name: &str, outcome: &PodOutcome) -> Result<()> {
    match outcome {
        PodOutcome::Succeeded => Ok(()),
        PodOutcome::Failed { exit_code, reason } => {
            let detail = match (exit_code, reason) {
                (Some(code), _) => format!("runner exited {code}"),
                (None, Some(reason)) => format!("runner failed: {reason}"),
                (None, None) => "runner failed".to_string(),
            };
            Err(Error::execution(format!("backup {backup_name}"), detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borgkube_common::config::{CacheConfig, RepoConfig, Retention};

    fn app_config() -> AppConfig {
        AppConfig {
            release_name: "myapp-backup".into(),
            app_name: "myapp".into(),
            namespace: "prod".into(),
            schedule: None,
            snapshot: vec![],
            backup: None,
        }
    }

    fn backup_section() -> BackupSection {
        BackupSection {
            volumes: vec![spec()],
            cache: CacheConfig {
                pvc_name: "borg-cache".into(),
                cache_the_cache: true,
            },
            repo: RepoConfig {
                endpoint: "ssh://borg@host/./repo".into(),
                passphrase: "p".into(),
                ssh_key: "key".into(),
            },
            pod_image: "ghcr.io/borgkube/runner:0.6.0".into(),
            privileged: true,
            retention: Retention {
                hourly: 24,
                daily: 7,
                weekly: 4,
                monthly: 6,
            },
        }
    }

    fn spec() -> BackupSpec {
        BackupSpec {
            name: "data".into(),
            pvc: "app-data".into(),
            clone_storage_class: "fast-clone".into(),
            archive_prefix: None,
            timeout: 3600,
            clone_bind_timeout: 300,
            borg_flags: None,
            pre_hooks: vec![],
            post_hooks: vec![],
        }
    }

    #[test]
    fn runner_config_carries_repo_and_defaulted_prefix() {
        let cfg = app_config();
        let backup = backup_section();
        let rc = build_runner_config(&cfg, &backup, &backup.volumes[0]);
        assert_eq!(rc.archive_prefix, "myapp-data");
        assert_eq!(rc.repo, "ssh://borg@host/./repo");
        assert_eq!(rc.timeout_seconds, 3600);
        assert!(rc.cache_the_cache);
        assert_eq!(rc.retention.daily, 7);
        assert!(rc.borg_flags.is_empty());
    }

    #[test]
    fn runner_config_honors_prefix_override_and_flags() {
        let cfg = app_config();
        let mut backup = backup_section();
        backup.volumes[0].archive_prefix = Some("legacy".into());
        backup.volumes[0].borg_flags = Some(vec!["--stats".into(), "--progress".into()]);
        let rc = build_runner_config(&cfg, &backup, &backup.volumes[0]);
        assert_eq!(rc.archive_prefix, "legacy");
        assert_eq!(rc.borg_flags, vec!["--stats".to_string(), "--progress".into()]);
    }

    #[test]
    fn classify_success() {
        assert!(classify_outcome("data", &PodOutcome::Succeeded).is_ok());
    }

    #[test]
    fn classify_failure_carries_exit_code() {
        let err = classify_outcome(
            "data",
            &PodOutcome::Failed {
                exit_code: Some(2),
                reason: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("runner exited 2"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn classify_sigterm_exit_is_a_plain_failure() {
        let err = classify_outcome(
            "data",
            &PodOutcome::Failed {
                exit_code: Some(143),
                reason: None,
            },
        )
        .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn classify_deadline_uses_reason() {
        let err = classify_outcome(
            "data",
            &PodOutcome::Failed {
                exit_code: None,
                reason: Some("DeadlineExceeded".into()),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("DeadlineExceeded"));
    }
}
