//! Typed VolumeSnapshot resources.
//!
//! VolumeSnapshot is a CSI custom resource, not part of `k8s-openapi`, so the
//! types are declared here and accessed through `DynamicObject` with a fixed
//! `ApiResource`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{is_conflict, is_not_found, Error, Result};
use crate::{LABEL_APP, LABEL_MANAGED_BY, LABEL_PVC, MANAGED_BY_VALUE};

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAPSHOT_VERSION: &str = "v1";
pub const SNAPSHOT_KIND: &str = "VolumeSnapshot";
pub const SNAPSHOT_PLURAL: &str = "volumesnapshots";

/// ApiResource for the VolumeSnapshot CRD.
pub fn api_resource() -> ApiResource {
    ApiResource {
        group: SNAPSHOT_GROUP.to_string(),
        version: SNAPSHOT_VERSION.to_string(),
        kind: SNAPSHOT_KIND.to_string(),
        api_version: format!("{SNAPSHOT_GROUP}/{SNAPSHOT_VERSION}"),
        plural: SNAPSHOT_PLURAL.to_string(),
    }
}

/// VolumeSnapshot resource.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    #[serde(default = "VolumeSnapshot::default_api_version")]
    pub api_version: String,
    #[serde(default = "VolumeSnapshot::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotStatus>,
}

impl VolumeSnapshot {
    fn default_api_version() -> String {
        format!("{SNAPSHOT_GROUP}/{SNAPSHOT_VERSION}")
    }
    fn default_kind() -> String {
        SNAPSHOT_KIND.to_string()
    }

    /// Build a new snapshot request for a PVC.
    pub fn new(name: &str, namespace: &str, pvc: &str, class: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_PVC.to_string(), crate::names::label_value(pvc));
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: VolumeSnapshotSpec {
                volume_snapshot_class_name: Some(class.to_string()),
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(pvc.to_string()),
                },
            },
            status: None,
        }
    }
}

/// VolumeSnapshot spec.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
    pub source: VolumeSnapshotSource,
}

/// Snapshot source; only PVC sources are used here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// Cluster-reported snapshot status.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

/// Error reported by the snapshot controller sidecar.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Flat summary of a snapshot, as the controllers consume it.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRef {
    pub name: String,
    pub namespace: String,
    pub source_pvc: String,
    pub creation_timestamp: DateTime<Utc>,
    pub ready_to_use: bool,
    pub restore_size: Option<String>,
}

impl SnapshotRef {
    /// Extract the summary from a full resource; `None` when the resource is
    /// missing its name or creation timestamp (never expected from a live
    /// API server).
    pub fn from_snapshot(snap: &VolumeSnapshot) -> Option<Self> {
        let name = snap.metadata.name.clone()?;
        let namespace = snap.metadata.namespace.clone().unwrap_or_default();
        let creation_timestamp = snap.metadata.creation_timestamp.as_ref()?.0;
        let source_pvc = snap
            .spec
            .source
            .persistent_volume_claim_name
            .clone()
            .or_else(|| {
                snap.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_PVC).cloned())
            })?;
        let status = snap.status.as_ref();
        Some(Self {
            name,
            namespace,
            source_pvc,
            creation_timestamp,
            ready_to_use: status.and_then(|s| s.ready_to_use).unwrap_or(false),
            restore_size: status.and_then(|s| s.restore_size.clone()),
        })
    }
}

/// The newest ready snapshot in a list, by creation timestamp.
pub fn newest_ready(refs: &[SnapshotRef]) -> Option<&SnapshotRef> {
    refs.iter()
        .filter(|r| r.ready_to_use)
        .max_by_key(|r| r.creation_timestamp)
}

fn to_dynamic(snap: &VolumeSnapshot) -> Result<DynamicObject> {
    let value = serde_json::to_value(snap)
        .map_err(|e| Error::serialization(format!("snapshot encode: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("snapshot encode: {e}")))
}

fn from_dynamic(obj: DynamicObject) -> Result<VolumeSnapshot> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization(format!("snapshot decode: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("snapshot decode: {e}")))
}

/// Typed operations on VolumeSnapshots in one namespace.
#[derive(Clone)]
pub struct SnapshotClient {
    api: Api<DynamicObject>,
}

impl SnapshotClient {
    pub fn new(client: &Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced_with(client.clone(), namespace, &api_resource()),
        }
    }

    /// Create a snapshot; a pre-existing snapshot of the same name is fine.
    pub async fn create(&self, snap: &VolumeSnapshot) -> Result<()> {
        let obj = to_dynamic(snap)?;
        match self.api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a snapshot; `Ok(None)` on 404.
    pub async fn get(&self, name: &str) -> Result<Option<VolumeSnapshot>> {
        match self.api.get(name).await {
            Ok(obj) => Ok(Some(from_dynamic(obj)?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List snapshots carrying `pvc={pvc}`.
    pub async fn list_for_pvc(&self, pvc: &str) -> Result<Vec<SnapshotRef>> {
        let lp = ListParams::default().labels(&format!("{LABEL_PVC}={}", crate::names::label_value(pvc)));
        let list = self.api.list(&lp).await?;
        let mut refs = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let snap = from_dynamic(obj)?;
            if let Some(r) = SnapshotRef::from_snapshot(&snap) {
                refs.push(r);
            }
        }
        Ok(refs)
    }

    /// The newest ready snapshot whose source PVC matches.
    pub async fn latest_ready(&self, pvc: &str) -> Result<Option<SnapshotRef>> {
        let refs = self.list_for_pvc(pvc).await?;
        Ok(newest_ready(&refs).cloned())
    }

    /// Delete a snapshot; 404 is success.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &kube::api::DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll with bounded backoff until `readyToUse=true`, the deadline
    /// expires, or the run is cancelled.
    pub async fn wait_ready(
        &self,
        name: &str,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<SnapshotRef> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
        let mut interval = std::time::Duration::from_secs(2);
        let max_interval = std::time::Duration::from_secs(10);

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(snap) = self.get(name).await? {
                if let Some(err) = snap.status.as_ref().and_then(|s| s.error.as_ref()) {
                    if let Some(msg) = &err.message {
                        warn!(snapshot = %name, error = %msg, "snapshot reported an error");
                    }
                }
                if let Some(r) = SnapshotRef::from_snapshot(&snap) {
                    if r.ready_to_use {
                        info!(snapshot = %name, "snapshot ready");
                        return Ok(r);
                    }
                }
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(Error::timeout(format!("snapshot {name} readiness"), timeout_secs));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            interval = std::cmp::min(interval * 2, max_interval);
        }
    }

    /// Delete several snapshots, logging failures as warnings. Returns the
    /// number that could not be deleted.
    pub async fn delete_all(&self, names: &[&str]) -> usize {
        let deletes = names.iter().map(|name| async move {
            match self.delete(name).await {
                Ok(()) => {
                    info!(snapshot = %name, "pruned snapshot");
                    true
                }
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "failed to prune snapshot");
                    false
                }
            }
        });
        join_all(deletes).await.iter().filter(|ok| !**ok).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, d, h, 0, 0).unwrap()
    }

    fn make_ref(name: &str, ts: DateTime<Utc>, ready: bool) -> SnapshotRef {
        SnapshotRef {
            name: name.to_string(),
            namespace: "prod".to_string(),
            source_pvc: "app-data".to_string(),
            creation_timestamp: ts,
            ready_to_use: ready,
            restore_size: None,
        }
    }

    #[test]
    fn snapshot_serializes_like_the_api_expects() {
        let snap = VolumeSnapshot::new("app-data-2026-04-01-10-00-00", "prod", "app-data", "csi-snapclass");
        let json = serde_json::to_value(&snap).unwrap();

        assert_eq!(json["apiVersion"], "snapshot.storage.k8s.io/v1");
        assert_eq!(json["kind"], "VolumeSnapshot");
        assert_eq!(json["spec"]["volumeSnapshotClassName"], "csi-snapclass");
        assert_eq!(json["spec"]["source"]["persistentVolumeClaimName"], "app-data");
        assert_eq!(json["metadata"]["labels"]["pvc"], "app-data");
        // No status on a fresh request.
        assert!(json.get("status").is_none());
    }

    #[test]
    fn status_roundtrip() {
        let json = serde_json::json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshot",
            "metadata": {"name": "s", "namespace": "prod"},
            "spec": {"source": {"persistentVolumeClaimName": "app-data"}},
            "status": {"readyToUse": true, "restoreSize": "10Gi"}
        });
        let snap: VolumeSnapshot = serde_json::from_value(json).unwrap();
        let status = snap.status.unwrap();
        assert_eq!(status.ready_to_use, Some(true));
        assert_eq!(status.restore_size.as_deref(), Some("10Gi"));
    }

    #[test]
    fn snapshot_ref_extraction() {
        let mut snap = VolumeSnapshot::new("s1", "prod", "app-data", "csi");
        snap.metadata.creation_timestamp = Some(Time(at(1, 10)));
        snap.status = Some(VolumeSnapshotStatus {
            ready_to_use: Some(true),
            restore_size: Some("5Gi".into()),
            ..Default::default()
        });

        let r = SnapshotRef::from_snapshot(&snap).unwrap();
        assert_eq!(r.name, "s1");
        assert_eq!(r.source_pvc, "app-data");
        assert!(r.ready_to_use);
        assert_eq!(r.restore_size.as_deref(), Some("5Gi"));
    }

    #[test]
    fn snapshot_ref_requires_creation_timestamp() {
        let snap = VolumeSnapshot::new("s1", "prod", "app-data", "csi");
        assert!(SnapshotRef::from_snapshot(&snap).is_none());
    }

    #[test]
    fn newest_ready_skips_unready() {
        let refs = vec![
            make_ref("old-ready", at(1, 0), true),
            make_ref("new-unready", at(2, 0), false),
            make_ref("mid-ready", at(1, 12), true),
        ];
        assert_eq!(newest_ready(&refs).unwrap().name, "mid-ready");
    }

    #[test]
    fn newest_ready_none_when_all_unready() {
        let refs = vec![make_ref("a", at(1, 0), false)];
        assert!(newest_ready(&refs).is_none());
    }
}
