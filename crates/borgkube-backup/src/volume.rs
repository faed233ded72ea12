//! Underlying-volume readiness for CSI drivers that expose a volume CR.
//!
//! Longhorn binds a PVC before the replica data is actually attachable; a
//! runner pod mounted at that point can read a volume that is still
//! degraded. When the storage class's provisioner is Longhorn, the engine
//! polls the driver's Volume CR until it reports attached and healthy, then
//! waits a fixed workload grace period. Other drivers skip this step.

use std::time::Duration;

use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use borgkube_common::error::is_not_found;
use borgkube_common::{Error, Result};

/// Provisioner string that identifies Longhorn storage classes.
pub const LONGHORN_PROVISIONER: &str = "driver.longhorn.io";

/// Namespace holding Longhorn's Volume CRs.
const LONGHORN_NAMESPACE: &str = "longhorn-system";

/// Grace period after the volume reports healthy, covering CSI workload
/// attach latency.
const WORKLOAD_GRACE: Duration = Duration::from_secs(15);

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Whether this provisioner advertises a volume CR worth waiting on.
pub fn needs_volume_wait(provisioner: &str) -> bool {
    provisioner == LONGHORN_PROVISIONER
}

fn volume_api_resource() -> ApiResource {
    ApiResource {
        group: "longhorn.io".to_string(),
        version: "v1beta2".to_string(),
        kind: "Volume".to_string(),
        api_version: "longhorn.io/v1beta2".to_string(),
        plural: "volumes".to_string(),
    }
}

/// Whether a Volume CR's status reports attached and healthy.
pub fn volume_is_ready(status: &serde_json::Value) -> bool {
    status.get("state").and_then(|v| v.as_str()) == Some("attached")
        && status.get("robustness").and_then(|v| v.as_str()) == Some("healthy")
}

/// Poll the driver's Volume CR for the given PV until attached+healthy,
/// then sleep the workload grace period.
pub async fn wait_volume_healthy(
    client: &Client,
    pv_name: &str,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), LONGHORN_NAMESPACE, &volume_api_resource());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match api.get(pv_name).await {
            Ok(volume) => {
                let status = volume.data.get("status").cloned().unwrap_or_default();
                if volume_is_ready(&status) {
                    info!(volume = %pv_name, "volume attached and healthy");
                    break;
                }
                debug!(
                    volume = %pv_name,
                    state = status.get("state").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    robustness = status.get("robustness").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    "volume not ready yet"
                );
            }
            // The CR trails PV creation briefly; keep polling.
            Err(e) if is_not_found(&e) => {
                debug!(volume = %pv_name, "volume CR not visible yet");
            }
            Err(e) => return Err(e.into()),
        }

        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            return Err(Error::timeout(format!("volume {pv_name} health"), timeout_secs));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(WORKLOAD_GRACE) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn longhorn_needs_the_wait_others_skip() {
        assert!(needs_volume_wait("driver.longhorn.io"));
        assert!(!needs_volume_wait("ebs.csi.aws.com"));
        assert!(!needs_volume_wait(""));
    }

    #[test]
    fn ready_requires_attached_and_healthy() {
        assert!(volume_is_ready(&json!({"state": "attached", "robustness": "healthy"})));
        assert!(!volume_is_ready(&json!({"state": "attached", "robustness": "degraded"})));
        assert!(!volume_is_ready(&json!({"state": "detached", "robustness": "healthy"})));
        assert!(!volume_is_ready(&json!({})));
    }
}
