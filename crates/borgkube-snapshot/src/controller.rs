//! Snapshot controller run loop.
//!
//! One run: pre-hooks per spec, parallel snapshot creation, readiness waits,
//! post-hooks in spec order, then retention pruning. Per-spec failures are
//! recorded and do not cancel peers; post-hooks run whenever their pre-hooks
//! ran, including after a termination signal.

use chrono::Utc;
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use borgkube_common::config::{AppConfig, SnapshotSpec};
use borgkube_common::hooks::HookExecutor;
use borgkube_common::report::RunReport;
use borgkube_common::retention;
use borgkube_common::signals::install_termination_handler;
use borgkube_common::snapshots::{SnapshotClient, VolumeSnapshot};
use borgkube_common::{names, Error, Result};

/// Execute one snapshot run; returns the process exit code.
pub async fn run(cfg: AppConfig, client: Client) -> Result<i32> {
    if cfg.snapshot.is_empty() {
        return Err(Error::config_field("snapshot", "no snapshot specs configured"));
    }

    let cancel = install_termination_handler()?;
    let snapshots = SnapshotClient::new(&client, &cfg.namespace);
    let hooks = HookExecutor::new(&client, &cfg.namespace);

    info!(
        namespace = %cfg.namespace,
        specs = cfg.snapshot.len(),
        "snapshot run starting"
    );

    let mut report = RunReport::new();
    let mut pre_hooks_ran = vec![false; cfg.snapshot.len()];
    let mut hook_failed = vec![false; cfg.snapshot.len()];

    // Pre-hooks, sequentially in spec order. A failed pre-hook sequence
    // fails its spec; the snapshot for that spec is not requested.
    for (i, spec) in cfg.snapshot.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        match hooks.run_all(&spec.pre_hooks).await {
            Ok(()) => pre_hooks_ran[i] = true,
            Err(e) => {
                error!(pvc = %spec.pvc, error = %e, "pre-hooks failed");
                hook_failed[i] = true;
            }
        }
    }

    // Parallel snapshot creation, one task per spec that is still eligible.
    let mut tasks: JoinSet<(usize, Result<String>)> = JoinSet::new();
    for (i, spec) in cfg.snapshot.iter().enumerate() {
        if !pre_hooks_ran[i] || cancel.is_cancelled() {
            continue;
        }
        let spec = spec.clone();
        let snapshots = snapshots.clone();
        let namespace = cfg.namespace.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            (i, create_and_wait(&snapshots, &namespace, &spec, &cancel).await)
        });
    }

    let mut results: Vec<Option<Result<String>>> = (0..cfg.snapshot.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((i, result)) => results[i] = Some(result),
            Err(e) => warn!(error = %e, "snapshot task panicked"),
        }
    }

    // Post-hooks, sequentially in spec order, for every spec whose pre-hooks
    // completed. They run regardless of the snapshot outcome and after a
    // signal; their failures are logged without masking snapshot results.
    for (i, spec) in cfg.snapshot.iter().enumerate() {
        if !pre_hooks_ran[i] {
            continue;
        }
        if let Err(e) = hooks.run_all(&spec.post_hooks).await {
            error!(pvc = %spec.pvc, error = %e, "post-hooks failed");
        }
    }

    // Fill the report in spec order.
    for (i, spec) in cfg.snapshot.iter().enumerate() {
        if hook_failed[i] {
            report.failed(&spec.pvc, "pre-hooks failed");
        } else if !pre_hooks_ran[i] {
            report.not_started(&spec.pvc, "run cancelled");
        } else {
            match results[i].take() {
                Some(Ok(name)) => {
                    info!(pvc = %spec.pvc, snapshot = %name, "snapshot ready");
                    report.succeeded(&spec.pvc);
                }
                Some(Err(Error::Cancelled)) => report.not_started(&spec.pvc, "run cancelled"),
                Some(Err(e)) => report.failed(&spec.pvc, e.to_string()),
                None => report.not_started(&spec.pvc, "run cancelled"),
            }
        }
    }
    if cancel.is_cancelled() {
        report.mark_cancelled();
    }

    // Retention pruning runs only after the run's creations are settled, and
    // never on the cancellation path.
    if !cancel.is_cancelled() {
        for spec in &cfg.snapshot {
            if let Err(e) = prune_spec(&snapshots, spec).await {
                warn!(pvc = %spec.pvc, error = %e, "snapshot pruning failed");
            }
        }
    }

    println!("{}", report.render());
    Ok(report.exit_code())
}

/// Create the snapshot for one spec and wait for `readyToUse`.
async fn create_and_wait(
    snapshots: &SnapshotClient,
    namespace: &str,
    spec: &SnapshotSpec,
    cancel: &CancellationToken,
) -> Result<String> {
    let name = names::snapshot_name(&spec.pvc, Utc::now());
    info!(pvc = %spec.pvc, snapshot = %name, class = %spec.snapshot_class, "requesting snapshot");

    let snap = VolumeSnapshot::new(&name, namespace, &spec.pvc, &spec.snapshot_class);
    snapshots.create(&snap).await?;
    snapshots.wait_ready(&name, spec.ready_timeout, cancel).await?;
    Ok(name)
}

/// Apply one volume's retention policy to its snapshot set.
async fn prune_spec(snapshots: &SnapshotClient, spec: &SnapshotSpec) -> Result<()> {
    let refs = snapshots.list_for_pvc(&spec.pvc).await?;
    if refs.is_empty() {
        return Ok(());
    }

    let items: Vec<(String, chrono::DateTime<Utc>)> = refs
        .iter()
        .map(|r| (r.name.clone(), r.creation_timestamp))
        .collect();
    let (kept, pruned) = retention::partition(&items, &spec.retention);
    info!(
        pvc = %spec.pvc,
        kept = kept.len(),
        pruned = pruned.len(),
        "retention selection"
    );

    let failures = snapshots.delete_all(&pruned).await;
    if failures > 0 {
        warn!(pvc = %spec.pvc, failures, "some snapshots could not be pruned");
    }
    Ok(())
}
