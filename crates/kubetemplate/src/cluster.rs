//! Cluster access abstraction
//!
//! The engine never talks to the Kubernetes API directly. It goes through
//! [`ClusterClient`] so tests can substitute an in-memory cluster.

use crate::error::ClusterError;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use std::fmt;

/// Kinds of cluster objects templates (and the source watcher) may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// `v1/ConfigMap`
    ConfigMap,
    /// `v1/Service`
    Service,
    /// `v1/Endpoints`
    Endpoints,
    /// `v1/Secret`
    Secret,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigMap => "ConfigMap",
            Self::Service => "Service",
            Self::Endpoints => "Endpoints",
            Self::Secret => "Secret",
        };
        f.write_str(name)
    }
}

/// Identity of a namespace-wide watch: one per kind and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    /// Watched kind
    pub kind: ResourceKind,
    /// Watched namespace
    pub namespace: String,
}

impl WatchKey {
    /// Creates a key for `kind` in `namespace`.
    pub fn new(kind: ResourceKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.namespace)
    }
}

/// A decoded cluster object.
#[derive(Debug, Clone)]
pub enum ClusterObject {
    /// A ConfigMap
    ConfigMap(ConfigMap),
    /// A Service
    Service(Service),
    /// An Endpoints object
    Endpoints(Endpoints),
    /// A Secret
    Secret(Secret),
}

impl ClusterObject {
    /// Kind of the wrapped object.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Service(_) => ResourceKind::Service,
            Self::Endpoints(_) => ResourceKind::Endpoints,
            Self::Secret(_) => ResourceKind::Secret,
        }
    }

    /// Unwraps a ConfigMap.
    ///
    /// # Errors
    /// Returns [`ClusterError::UnexpectedKind`] for any other kind.
    pub fn into_config_map(self) -> Result<ConfigMap, ClusterError> {
        match self {
            Self::ConfigMap(cm) => Ok(cm),
            other => Err(other.mismatch(ResourceKind::ConfigMap)),
        }
    }

    /// Unwraps a Service.
    ///
    /// # Errors
    /// Returns [`ClusterError::UnexpectedKind`] for any other kind.
    pub fn into_service(self) -> Result<Service, ClusterError> {
        match self {
            Self::Service(svc) => Ok(svc),
            other => Err(other.mismatch(ResourceKind::Service)),
        }
    }

    /// Unwraps an Endpoints object.
    ///
    /// # Errors
    /// Returns [`ClusterError::UnexpectedKind`] for any other kind.
    pub fn into_endpoints(self) -> Result<Endpoints, ClusterError> {
        match self {
            Self::Endpoints(ep) => Ok(ep),
            other => Err(other.mismatch(ResourceKind::Endpoints)),
        }
    }

    /// Unwraps a Secret.
    ///
    /// # Errors
    /// Returns [`ClusterError::UnexpectedKind`] for any other kind.
    pub fn into_secret(self) -> Result<Secret, ClusterError> {
        match self {
            Self::Secret(secret) => Ok(secret),
            other => Err(other.mismatch(ResourceKind::Secret)),
        }
    }

    fn mismatch(&self, expected: ResourceKind) -> ClusterError {
        ClusterError::UnexpectedKind {
            expected,
            actual: self.kind(),
        }
    }
}

/// Stream of change notifications from a watch.
///
/// `Ok(())` means "something changed"; the stream ends when the watch closes
/// and yields `Err` when the watch breaks.
pub type ChangeStream = BoxStream<'static, Result<(), ClusterError>>;

/// Trait for cluster operations used by the engine and the source watcher
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a single object by kind, namespace and name.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClusterError>;

    /// Opens a watch over every object of `key.kind` in `key.namespace`.
    ///
    /// The initial listing is not reported as a change.
    fn watch(&self, key: &WatchKey) -> ChangeStream;

    /// Opens a watch over a single named object.
    fn watch_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> ChangeStream;
}

/// Flattens the ready addresses of every subset into a list of IPs.
#[must_use]
pub fn endpoint_ips(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|addr| addr.ip.clone())
        .collect()
}
