//! Clone PVC provisioning and readiness.
//!
//! A clone PVC materializes a VolumeSnapshot as a mountable volume. Two
//! binding modes need different readiness predicates:
//!
//! - Immediate: the PVC reaches `Bound` on its own.
//! - WaitForFirstConsumer: the PVC stays `Pending` until a consumer pod is
//!   scheduled, so waiting for `Bound` would deadlock. A
//!   `WaitForFirstConsumer` event on the PVC means provisioning is parked
//!   and the runner pod can be created.
//!
//! While waiting, PVC events are scanned every 10 s for failure keywords so
//! a broken provisioner fails fast instead of burning the whole timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Event, PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use borgkube_common::kube_client::ClusterClient;
use borgkube_common::snapshots::SNAPSHOT_GROUP;
use borgkube_common::{names, Error, Result, LABEL_APP, LABEL_MANAGED_BY, LABEL_PVC, MANAGED_BY_VALUE};

/// Clone size fallback when the snapshot reports no restoreSize.
pub const DEFAULT_CLONE_SIZE: &str = "1Gi";

/// Event substrings that mean provisioning is not going to succeed.
pub const FAILURE_KEYWORDS: &[&str] =
    &["ProvisioningFailed", "not found", "failed", "cannot", "unable"];

/// Poll interval for the PVC phase; events are scanned every other cycle.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// PVC binding mode, read from the storage class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingMode {
    Immediate,
    WaitForFirstConsumer,
}

/// Binding mode of a storage class; unset means Immediate.
pub fn binding_mode(sc: &StorageClass) -> BindingMode {
    match sc.volume_binding_mode.as_deref() {
        Some("WaitForFirstConsumer") => BindingMode::WaitForFirstConsumer,
        _ => BindingMode::Immediate,
    }
}

/// Build the clone PVC manifest from a snapshot.
pub fn build_clone_pvc(
    name: &str,
    namespace: &str,
    snapshot_name: &str,
    storage_class: &str,
    size: &str,
) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_PVC.to_string(), names::label_value(name));

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOncePod".to_string()]),
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some(SNAPSHOT_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: snapshot_name.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// First event that indicates provisioning failure, rendered as a message.
pub fn event_failure(events: &[Event]) -> Option<String> {
    events.iter().find_map(|event| {
        let message = event.message.as_deref().unwrap_or("");
        let reason = event.reason.as_deref().unwrap_or("");
        let hit = FAILURE_KEYWORDS
            .iter()
            .any(|kw| message.contains(kw) || reason.contains(kw));
        if hit {
            Some(format!("{reason}: {message}"))
        } else {
            None
        }
    })
}

/// Whether an event marks the PVC as parked for its first consumer.
pub fn is_wait_for_first_consumer(event: &Event) -> bool {
    event.reason.as_deref() == Some("WaitForFirstConsumer")
        || event
            .message
            .as_deref()
            .is_some_and(|m| m.contains("waiting for first consumer"))
}

/// Wait for the clone PVC to become mountable.
///
/// For Immediate binding that means `Bound`; for WaitForFirstConsumer it
/// means the parked-for-consumer event was observed. Provisioning failures
/// detected in events fail fast with the event message.
pub async fn wait_clone_ready(
    cluster: &ClusterClient,
    pvc_name: &str,
    mode: BindingMode,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let pvcs = cluster.pvcs();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut cycles: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let pvc = pvcs.get(pvc_name).await?;
        let phase = pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Pending");

        if phase == "Bound" {
            info!(pvc = %pvc_name, "clone PVC bound");
            return Ok(());
        }

        // Event scan: failure keywords every second cycle (10 s), and the
        // WaitForFirstConsumer predicate whenever binding is consumer-driven.
        let scan_failures = cycles % 2 == 1;
        if scan_failures || mode == BindingMode::WaitForFirstConsumer {
            let events = cluster.events_for("PersistentVolumeClaim", pvc_name).await?;
            if mode == BindingMode::WaitForFirstConsumer
                && events.iter().any(is_wait_for_first_consumer)
            {
                info!(pvc = %pvc_name, "clone PVC waiting for first consumer, proceeding");
                return Ok(());
            }
            if scan_failures {
                if let Some(message) = event_failure(&events) {
                    return Err(Error::provisioning(pvc_name, message));
                }
            }
        }

        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            return Err(Error::timeout(format!("clone PVC {pvc_name} bind"), timeout_secs));
        }
        debug!(pvc = %pvc_name, phase = %phase, "clone PVC not ready yet");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        cycles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(reason: &str, message: &str) -> Event {
        Event {
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn clone_pvc_references_the_snapshot() {
        let pvc = build_clone_pvc(
            "myapp-backup-clone-data-1770091506000",
            "prod",
            "app-data-2026-02-03-04-05-06",
            "fast-clone",
            "10Gi",
        );
        let spec = pvc.spec.unwrap();
        let ds = spec.data_source.unwrap();
        assert_eq!(ds.kind, "VolumeSnapshot");
        assert_eq!(ds.api_group.as_deref(), Some("snapshot.storage.k8s.io"));
        assert_eq!(ds.name, "app-data-2026-02-03-04-05-06");
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast-clone"));
        assert_eq!(
            spec.access_modes.as_deref(),
            Some(&["ReadWriteOncePod".to_string()][..])
        );
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "10Gi");
    }

    #[test]
    fn clone_pvc_label_values_stay_legal() {
        let long = format!("release-clone-{}-1770091506000", "n".repeat(60));
        let pvc = build_clone_pvc(&long, "prod", "snap", "sc", DEFAULT_CLONE_SIZE);
        let labels = pvc.metadata.labels.unwrap();
        assert!(labels[LABEL_PVC].len() <= 63);
    }

    #[test]
    fn binding_mode_defaults_to_immediate() {
        let sc = StorageClass::default();
        assert_eq!(binding_mode(&sc), BindingMode::Immediate);

        let wffc = StorageClass {
            volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
            ..Default::default()
        };
        assert_eq!(binding_mode(&wffc), BindingMode::WaitForFirstConsumer);
    }

    #[test]
    fn failure_keywords_match_reason_or_message() {
        let events = vec![
            event("Provisioning", "External provisioner is provisioning volume"),
            event("ProvisioningFailed", "storageclass.storage.k8s.io \"fast-clone\" not found"),
        ];
        let msg = event_failure(&events).unwrap();
        assert!(msg.contains("ProvisioningFailed"));
        assert!(msg.contains("fast-clone"));
    }

    #[test]
    fn benign_events_do_not_fail() {
        let events = vec![
            event("WaitForFirstConsumer", "waiting for first consumer to be created"),
            event("Provisioning", "provisioning volume"),
        ];
        assert!(event_failure(&events).is_none());
    }

    #[test]
    fn wffc_event_detection() {
        assert!(is_wait_for_first_consumer(&event(
            "WaitForFirstConsumer",
            "waiting for first consumer to be created before binding"
        )));
        assert!(is_wait_for_first_consumer(&event(
            "ExternalProvisioning",
            "waiting for first consumer"
        )));
        assert!(!is_wait_for_first_consumer(&event("Provisioning", "in progress")));
    }
}
