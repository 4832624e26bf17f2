//! Mock cluster and discovery for unit testing
//!
//! [`MockClusterClient`] keeps objects in memory, counts watch registrations
//! and lets a test fire, fail or close any watch it handed out.

#![allow(clippy::unwrap_used, reason = "test support code")]

use crate::cluster::{ChangeStream, ClusterClient, ClusterObject, ResourceKind, WatchKey};
use crate::discovery::Discoverer;
use crate::error::{ClusterError, ResolveError};
use futures::StreamExt;
use futures::channel::mpsc;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    ConfigMap, EndpointAddress, EndpointSubset, Endpoints, Secret, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ObjectKey = (ResourceKind, String, String);
type Sender = mpsc::UnboundedSender<Result<(), ClusterError>>;

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// In-memory cluster for tests
#[derive(Clone, Default)]
pub struct MockClusterClient {
    objects: Arc<Mutex<HashMap<ObjectKey, ClusterObject>>>,
    get_calls: Arc<Mutex<Vec<ObjectKey>>>,
    watch_calls: Arc<Mutex<HashMap<WatchKey, usize>>>,
    watch_senders: Arc<Mutex<HashMap<WatchKey, Vec<Sender>>>>,
    object_watch_calls: Arc<Mutex<HashMap<ObjectKey, usize>>>,
    object_senders: Arc<Mutex<HashMap<ObjectKey, Vec<Sender>>>>,
    get_delay: Arc<Mutex<Option<Duration>>>,
    get_error: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock cluster
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object (for test setup)
    pub fn insert(&self, namespace: &str, name: &str, object: ClusterObject) {
        self.objects.lock().unwrap().insert(
            (object.kind(), namespace.to_string(), name.to_string()),
            object,
        );
    }

    /// Remove an object
    pub fn remove(&self, kind: ResourceKind, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// Store a ConfigMap with the given data
    pub fn add_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data: BTreeMap<String, String> = data
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let cm = ConfigMap {
            metadata: meta(namespace, name),
            data: Some(data),
            ..Default::default()
        };
        self.insert(namespace, name, ClusterObject::ConfigMap(cm));
    }

    /// Store a Service with the given cluster IP
    pub fn add_service(&self, namespace: &str, name: &str, cluster_ip: &str) {
        let svc = Service {
            metadata: meta(namespace, name),
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.insert(namespace, name, ClusterObject::Service(svc));
    }

    /// Store an Endpoints object with a single subset of ready addresses
    pub fn add_endpoints(&self, namespace: &str, name: &str, ips: &[&str]) {
        let addresses = ips
            .iter()
            .map(|ip| EndpointAddress {
                ip: (*ip).to_string(),
                ..Default::default()
            })
            .collect();
        let ep = Endpoints {
            metadata: meta(namespace, name),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(addresses),
                ..Default::default()
            }]),
        };
        self.insert(namespace, name, ClusterObject::Endpoints(ep));
    }

    /// Store a Secret with a single binary key
    pub fn add_secret(&self, namespace: &str, name: &str, key: &str, value: &[u8]) {
        let mut data = BTreeMap::new();
        data.insert(key.to_string(), ByteString(value.to_vec()));
        let secret = Secret {
            metadata: meta(namespace, name),
            data: Some(data),
            ..Default::default()
        };
        self.insert(namespace, name, ClusterObject::Secret(secret));
    }

    /// Delay every `get` by `delay`
    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Make every `get` fail with an API error
    pub fn set_get_error(&self, message: &str) {
        *self.get_error.lock().unwrap() = Some(message.to_string());
    }

    /// Number of `get` calls served so far
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.get_calls.lock().unwrap().len()
    }

    /// Number of times a namespace-wide watch was opened for `key`
    #[must_use]
    pub fn watch_count(&self, key: &WatchKey) -> usize {
        self.watch_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Total number of namespace-wide watches opened
    #[must_use]
    pub fn total_watch_count(&self) -> usize {
        self.watch_calls.lock().unwrap().values().sum()
    }

    /// Number of times a single-object watch was opened
    #[must_use]
    pub fn object_watch_count(&self, kind: ResourceKind, namespace: &str, name: &str) -> usize {
        self.object_watch_calls
            .lock()
            .unwrap()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Report a change on every open watch for `key`
    pub fn trigger(&self, key: &WatchKey) {
        send(self.watch_senders.lock().unwrap().get(key), || Ok(()));
    }

    /// Report an error on every open watch for `key`
    pub fn fail(&self, key: &WatchKey, message: &str) {
        send(self.watch_senders.lock().unwrap().get(key), || {
            Err(ClusterError::Watch(message.to_string()))
        });
    }

    /// End every open watch for `key`
    pub fn close(&self, key: &WatchKey) {
        self.watch_senders.lock().unwrap().remove(key);
    }

    /// Report a change on every open watch of a single object
    pub fn trigger_object(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let senders = self.object_senders.lock().unwrap();
        send(
            senders.get(&(kind, namespace.to_string(), name.to_string())),
            || Ok(()),
        );
    }

    /// End every open watch of a single object
    pub fn close_object(&self, kind: ResourceKind, namespace: &str, name: &str) {
        self.object_senders
            .lock()
            .unwrap()
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }
}

fn send(senders: Option<&Vec<Sender>>, event: impl Fn() -> Result<(), ClusterError>) {
    for tx in senders.into_iter().flatten() {
        let _ = tx.unbounded_send(event());
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClusterError> {
        let key = (kind, namespace.to_string(), name.to_string());
        self.get_calls.lock().unwrap().push(key.clone());

        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.get_error.lock().unwrap().clone() {
            return Err(ClusterError::Api(message));
        }

        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn watch(&self, key: &WatchKey) -> ChangeStream {
        *self
            .watch_calls
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default() += 1;
        let (tx, rx) = mpsc::unbounded();
        self.watch_senders
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(tx);
        rx.boxed()
    }

    fn watch_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> ChangeStream {
        let key = (kind, namespace.to_string(), name.to_string());
        *self
            .object_watch_calls
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default() += 1;
        let (tx, rx) = mpsc::unbounded();
        self.object_senders
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(tx);
        rx.boxed()
    }
}

/// Discoverer answering from fixed values
#[derive(Debug, Clone)]
pub struct StaticDiscoverer {
    /// Host name
    pub hostname: String,
    /// Private IPv4 address
    pub private_ipv4: Ipv4Addr,
    /// Public IPv4 address
    pub public_ipv4: Ipv4Addr,
    /// Public IPv6 address, `None` to fail lookups
    pub public_ipv6: Option<Ipv6Addr>,
}

impl Default for StaticDiscoverer {
    fn default() -> Self {
        Self {
            hostname: "asterisk-0".to_string(),
            private_ipv4: Ipv4Addr::new(10, 0, 0, 10),
            public_ipv4: Ipv4Addr::new(203, 0, 113, 10),
            public_ipv6: None,
        }
    }
}

#[async_trait::async_trait]
impl Discoverer for StaticDiscoverer {
    async fn hostname(&self) -> Result<String, ResolveError> {
        Ok(self.hostname.clone())
    }

    async fn private_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        Ok(self.private_ipv4)
    }

    async fn public_ipv4(&self) -> Result<Ipv4Addr, ResolveError> {
        Ok(self.public_ipv4)
    }

    async fn public_ipv6(&self) -> Result<Ipv6Addr, ResolveError> {
        self.public_ipv6
            .ok_or_else(|| ResolveError::Discovery("no public IPv6 address".to_string()))
    }
}
