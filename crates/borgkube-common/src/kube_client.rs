//! Cluster client façade.
//!
//! A thin typed surface over the Kubernetes API: the resources the
//! controllers touch, idempotent create/delete helpers, and credential
//! discovery. Authentication resolves in order: in-cluster token, explicit
//! kubeconfig path, default kubeconfig. Failure to obtain any is fatal at
//! startup.

use std::path::Path;

use k8s_openapi::api::core::v1::{Event, Node, PersistentVolume, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::error::{is_conflict, is_not_found, Error, Result};

/// Create a kube client: in-cluster first, then an explicit kubeconfig path,
/// then the default kubeconfig chain.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    if let Ok(config) = Config::incluster() {
        debug!("using in-cluster service account credentials");
        return Client::try_from(config).map_err(Error::from);
    }

    match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "using explicit kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {e}")))?;
            Client::try_from(config).map_err(Error::from)
        }
        None => {
            debug!("using default kubeconfig chain");
            Client::try_default().await.map_err(Error::from)
        }
    }
}

/// Namespaced handle bundling the client with the app namespace.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    namespace: String,
}

impl ClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn storage_classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }

    pub fn persistent_volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Read a storage class; `Ok(None)` when it does not exist.
    pub async fn storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        match self.storage_classes().get(name).await {
            Ok(sc) => Ok(Some(sc)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List events for a namespaced object by kind and name.
    pub async fn events_for(&self, kind: &str, name: &str) -> Result<Vec<Event>> {
        let selector = format!("involvedObject.kind={kind},involvedObject.name={name}");
        let list = self
            .events()
            .list(&ListParams::default().fields(&selector))
            .await?;
        Ok(list.items)
    }
}

/// Create an object, treating a 409 (already exists) as success.
pub async fn create_idempotent<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(e) if is_conflict(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, treating a 404 as success. Returns whether it existed.
pub async fn delete_idempotent<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &kube::api::DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
