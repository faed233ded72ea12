//! Tracked-resources registry.
//!
//! Every short-lived resource a controller creates (runner pods, clone PVCs,
//! ephemeral secrets) is registered here *before* the create call goes out
//! and deregistered only after its deletion has been observed as a 404.
//! On any exit (success, failure or signal) the registry is drained, so no
//! clone or secret leaks past process exit.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams};
use kube::Client;
use tracing::{info, warn};

use crate::error::is_not_found;

/// Kinds the registry knows how to delete. Ordering is drain priority:
/// pods first (releases volume mounts), then PVCs, then secrets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    Secret,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Pod => "pod",
            ResourceKind::PersistentVolumeClaim => "pvc",
            ResourceKind::Secret => "secret",
        };
        f.write_str(s)
    }
}

/// One registered resource.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackedResource {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

/// Process-local, mutex-guarded registry of resources to reclaim.
#[derive(Default)]
pub struct TrackedResources {
    inner: Mutex<BTreeSet<TrackedResource>>,
}

impl TrackedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Must happen before the creating API call.
    pub fn register(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().expect("registry mutex");
        inner.insert(TrackedResource {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    /// Deregister a resource whose deletion has been observed (404).
    pub fn deregister(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().expect("registry mutex");
        inner.remove(&TrackedResource {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    /// Copy of the current contents in drain order (pod, pvc, secret).
    pub fn snapshot(&self) -> Vec<TrackedResource> {
        let inner = self.inner.lock().expect("registry mutex");
        inner.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("registry mutex").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry mutex").len()
    }

    /// Delete everything still registered, in drain order. Best effort per
    /// resource: individual delete errors are logged and do not stop the
    /// drain. Returns the number of resources that could not be reclaimed.
    pub async fn drain(&self, client: &Client) -> usize {
        // Copy under the mutex, operate outside it.
        let resources = self.snapshot();
        if resources.is_empty() {
            return 0;
        }
        info!(count = resources.len(), "draining tracked resources");

        let mut failures = 0;
        for res in resources {
            match delete_resource(client, &res).await {
                Ok(()) => {
                    self.deregister(res.kind, &res.namespace, &res.name);
                    info!(kind = %res.kind, name = %res.name, "reclaimed");
                }
                Err(e) => {
                    failures += 1;
                    warn!(kind = %res.kind, name = %res.name, error = %e, "failed to reclaim");
                }
            }
        }
        failures
    }
}

/// Delete one resource and wait for the 404 that confirms it is gone.
async fn delete_resource(client: &Client, res: &TrackedResource) -> kube::Result<()> {
    match res.kind {
        ResourceKind::Pod => {
            let api: Api<Pod> = Api::namespaced(client.clone(), &res.namespace);
            delete_and_confirm(&api, &res.name).await
        }
        ResourceKind::PersistentVolumeClaim => {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &res.namespace);
            delete_and_confirm(&api, &res.name).await
        }
        ResourceKind::Secret => {
            let api: Api<Secret> = Api::namespaced(client.clone(), &res.namespace);
            delete_and_confirm(&api, &res.name).await
        }
    }
}

/// How long to poll for the confirming 404 after a delete.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
const CONFIRM_INTERVAL: Duration = Duration::from_secs(2);

/// Issue a delete (404 is success) and poll until the object is gone.
pub async fn delete_and_confirm<K>(api: &Api<K>, name: &str) -> kube::Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
    }

    let deadline = tokio::time::Instant::now() + CONFIRM_TIMEOUT;
    loop {
        match api.get(name).await {
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
            Ok(_) if tokio::time::Instant::now() >= deadline => {
                // Deletion issued but not yet observed; report as an API
                // timeout so the caller logs it and keeps draining.
                return Err(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("{name} still present after delete"),
                    reason: "Timeout".to_string(),
                    code: 504,
                }));
            }
            Ok(_) => tokio::time::sleep(CONFIRM_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_deregister_roundtrip() {
        let reg = TrackedResources::new();
        assert!(reg.is_empty());

        reg.register(ResourceKind::Secret, "prod", "runner-config");
        reg.register(ResourceKind::Pod, "prod", "runner");
        assert_eq!(reg.len(), 2);

        reg.deregister(ResourceKind::Pod, "prod", "runner");
        assert_eq!(reg.len(), 1);
        reg.deregister(ResourceKind::Secret, "prod", "runner-config");
        assert!(reg.is_empty());
    }

    #[test]
    fn deregister_unknown_is_noop() {
        let reg = TrackedResources::new();
        reg.register(ResourceKind::Pod, "prod", "runner");
        reg.deregister(ResourceKind::Pod, "other", "runner");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn snapshot_orders_pod_pvc_secret() {
        let reg = TrackedResources::new();
        reg.register(ResourceKind::Secret, "prod", "s");
        reg.register(ResourceKind::PersistentVolumeClaim, "prod", "c");
        reg.register(ResourceKind::Pod, "prod", "p");

        let kinds: Vec<ResourceKind> = reg.snapshot().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Pod,
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::Secret
            ]
        );
    }

    #[test]
    fn duplicate_registration_is_deduplicated() {
        let reg = TrackedResources::new();
        reg.register(ResourceKind::Pod, "prod", "runner");
        reg.register(ResourceKind::Pod, "prod", "runner");
        assert_eq!(reg.len(), 1);
    }
}
