//! Kubernetes implementation of [`ClusterClient`].

use crate::cluster::{ChangeStream, ClusterClient, ClusterObject, ResourceKind, WatchKey};
use crate::error::ClusterError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use kube::{Api, Client};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// Cluster client backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an existing kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the in-cluster configuration (or local kubeconfig).
    ///
    /// # Errors
    /// Returns [`ClusterError::Api`] if no usable configuration is found.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn fetch<K>(
    api: Api<K>,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> Result<K, ClusterError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    debug!("Fetching {} {}/{}", kind, namespace, name);
    api.get_opt(name).await?.ok_or_else(|| ClusterError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

/// Turns a kube watcher into a stream of change notifications.
///
/// The first listing (`Init` .. `InitDone`) describes the state we are about
/// to render from, so it is swallowed. A later relist means the watch lost
/// track of events, which is reported as a change.
fn changes<K>(api: Api<K>, config: watcher::Config) -> ChangeStream
where
    K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut initialized = false;
    watcher(api, config)
        .filter_map(move |event| {
            let change = match event {
                Ok(watcher::Event::Apply(_) | watcher::Event::Delete(_)) => Some(Ok(())),
                Ok(watcher::Event::Init) => initialized.then_some(Ok(())),
                Ok(watcher::Event::InitApply(_)) => None,
                Ok(watcher::Event::InitDone) => {
                    initialized = true;
                    None
                }
                Err(e) => Some(Err(ClusterError::Watch(e.to_string()))),
            };
            futures::future::ready(change)
        })
        .boxed()
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClusterError> {
        match kind {
            ResourceKind::ConfigMap => fetch(self.api::<ConfigMap>(namespace), kind, namespace, name)
                .await
                .map(ClusterObject::ConfigMap),
            ResourceKind::Service => fetch(self.api::<Service>(namespace), kind, namespace, name)
                .await
                .map(ClusterObject::Service),
            ResourceKind::Endpoints => fetch(self.api::<Endpoints>(namespace), kind, namespace, name)
                .await
                .map(ClusterObject::Endpoints),
            ResourceKind::Secret => fetch(self.api::<Secret>(namespace), kind, namespace, name)
                .await
                .map(ClusterObject::Secret),
        }
    }

    fn watch(&self, key: &WatchKey) -> ChangeStream {
        let config = watcher::Config::default();
        match key.kind {
            ResourceKind::ConfigMap => changes(self.api::<ConfigMap>(&key.namespace), config),
            ResourceKind::Service => changes(self.api::<Service>(&key.namespace), config),
            ResourceKind::Endpoints => changes(self.api::<Endpoints>(&key.namespace), config),
            ResourceKind::Secret => changes(self.api::<Secret>(&key.namespace), config),
        }
    }

    fn watch_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> ChangeStream {
        // Only this object: events for its neighbours never reach us
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        match kind {
            ResourceKind::ConfigMap => changes(self.api::<ConfigMap>(namespace), config),
            ResourceKind::Service => changes(self.api::<Service>(namespace), config),
            ResourceKind::Endpoints => changes(self.api::<Endpoints>(namespace), config),
            ResourceKind::Secret => changes(self.api::<Secret>(namespace), config),
        }
    }
}
