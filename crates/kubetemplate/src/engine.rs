//! Template evaluation context
//!
//! An [`Engine`] answers the resolver functions templates call and arms a
//! watch for every (kind, namespace) it looks up until the first render
//! has completed. A fresh engine is built for every render cycle.
//!
//! Resolver methods are synchronous: they are called from template
//! evaluation, which runs on a blocking thread, and bridge to the async
//! cluster client through the runtime handle the engine was built with.

use crate::cluster::{ClusterClient, ClusterObject, ResourceKind, WatchKey, endpoint_ips};
use crate::discovery::{Discoverer, NetworkFact};
use crate::error::{ClusterError, EngineError, ResolveError};
use crate::watch::{ChangeState, WatchRegistry};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on every cluster lookup
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings an [`Engine`] is built with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Namespace used when a template omits one
    pub default_namespace: Option<String>,
    /// Bound on every cluster or discovery lookup
    pub api_timeout: Duration,
    /// Values `env(...)` returns ahead of the process environment
    pub env_overrides: HashMap<String, String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_namespace: None,
            api_timeout: DEFAULT_API_TIMEOUT,
            env_overrides: HashMap::new(),
        }
    }
}

/// Resolver and watch owner for one render cycle.
pub struct Engine {
    cluster: Arc<dyn ClusterClient>,
    discoverer: Arc<dyn Discoverer>,
    runtime: Handle,
    options: EngineOptions,
    first_render_completed: AtomicBool,
    watches: WatchRegistry,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("first_render_completed", &self.first_render_completed)
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine whose watches live until it is closed or `parent` is cancelled.
    ///
    /// Watch consumers are spawned on `runtime`.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        discoverer: Arc<dyn Discoverer>,
        options: EngineOptions,
        parent: &CancellationToken,
        runtime: Handle,
    ) -> Self {
        let cancel = parent.child_token();
        Self {
            cluster,
            discoverer,
            runtime,
            options,
            first_render_completed: AtomicBool::new(false),
            watches: WatchRegistry::new(cancel.clone()),
            cancel,
        }
    }

    /// Stops arming watches. Called once the learn pass is over.
    pub fn set_first_render_completed(&self) {
        self.first_render_completed.store(true, Ordering::SeqCst);
    }

    /// Whether watches are no longer armed by lookups.
    #[must_use]
    pub fn first_render_completed(&self) -> bool {
        self.first_render_completed.load(Ordering::SeqCst)
    }

    /// Keys of the watches armed so far, sorted.
    #[must_use]
    pub fn armed_watches(&self) -> Vec<WatchKey> {
        self.watches.keys()
    }

    /// The watch registry, for state inspection.
    #[must_use]
    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }

    /// Whether any watched resource has changed or failed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.watches.change_state() != ChangeState::Clean
    }

    /// Waits for a change on any armed watch.
    ///
    /// # Errors
    /// [`EngineError::WatchFailed`] if a watch broke, [`EngineError::Cancelled`]
    /// if the engine was closed first.
    pub async fn wait(&self) -> Result<(), EngineError> {
        self.watches.wait().await
    }

    /// Cancels every watch. Lookups in flight fail with [`ResolveError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Looks up a ConfigMap.
    ///
    /// # Errors
    /// See [`ResolveError`].
    pub fn config_map(&self, name: &str, namespace: Option<&str>) -> Result<ConfigMap, ResolveError> {
        Ok(self
            .lookup(ResourceKind::ConfigMap, name, namespace)?
            .into_config_map()?)
    }

    /// Looks up a Service.
    ///
    /// # Errors
    /// See [`ResolveError`].
    pub fn service(&self, name: &str, namespace: Option<&str>) -> Result<Service, ResolveError> {
        Ok(self
            .lookup(ResourceKind::Service, name, namespace)?
            .into_service()?)
    }

    /// Looks up an Endpoints object.
    ///
    /// # Errors
    /// See [`ResolveError`].
    pub fn endpoints(&self, name: &str, namespace: Option<&str>) -> Result<Endpoints, ResolveError> {
        Ok(self
            .lookup(ResourceKind::Endpoints, name, namespace)?
            .into_endpoints()?)
    }

    /// Addresses of every subset of an Endpoints object, in order.
    ///
    /// # Errors
    /// See [`ResolveError`].
    pub fn endpoint_ips(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ResolveError> {
        self.endpoints(name, namespace).map(|ep| endpoint_ips(&ep))
    }

    /// Answers a network discovery query such as `hostname` or `publicv4`.
    ///
    /// # Errors
    /// [`ResolveError::UnsupportedQuery`] for unknown keys, otherwise see [`ResolveError`].
    pub fn network(&self, query: &str) -> Result<String, ResolveError> {
        let fact: NetworkFact = query.parse()?;
        let timeout = self.options.api_timeout;
        self.bridge(async {
            tokio::time::timeout(timeout, self.discoverer.lookup(fact))
                .await
                .unwrap_or_else(|_| {
                    Err(ResolveError::Discovery(format!(
                        "{query} lookup timed out after {}s",
                        timeout.as_secs()
                    )))
                })
        })
    }

    /// Reads an environment value, preferring the engine's overrides.
    ///
    /// Unset values resolve to an empty string.
    #[must_use]
    pub fn env(&self, name: &str) -> String {
        if let Some(value) = self.options.env_overrides.get(name) {
            return value.clone();
        }
        std::env::var(name).unwrap_or_default()
    }

    fn namespace_for(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<String, ResolveError> {
        namespace
            .filter(|ns| !ns.is_empty())
            .or(self.options.default_namespace.as_deref())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NamespaceUnresolved {
                kind,
                name: name.to_string(),
            })
    }

    fn lookup(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<ClusterObject, ResolveError> {
        let namespace = self.namespace_for(kind, name, namespace)?;
        let timeout = self.options.api_timeout;
        debug!("Resolving {} {}/{}", kind, namespace, name);

        let result = self.bridge(async {
            match tokio::time::timeout(timeout, self.cluster.get(kind, &namespace, name)).await {
                Ok(result) => result.map_err(ResolveError::from),
                Err(_) => Err(ResolveError::Timeout {
                    kind,
                    namespace: namespace.clone(),
                    name: name.to_string(),
                    seconds: timeout.as_secs(),
                }),
            }
        });

        // A missing object may be created later, so it is watched too
        if matches!(
            result,
            Ok(_) | Err(ResolveError::Cluster(ClusterError::NotFound { .. }))
        ) && !self.first_render_completed()
        {
            self.watches.arm(
                &WatchKey::new(kind, namespace),
                self.cluster.as_ref(),
                &self.runtime,
            );
        }

        result
    }

    /// Drives `fut` to completion from a blocking thread, giving up when the engine closes.
    fn bridge<T>(&self, fut: impl Future<Output = Result<T, ResolveError>>) -> Result<T, ResolveError> {
        let cancel = self.cancel.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                () = cancel.cancelled() => Err(ResolveError::Closed),
                result = fut => result,
            }
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClusterClient, StaticDiscoverer};
    use crate::watch::WatchState;

    fn engine(cluster: &MockClusterClient, namespace: Option<&str>) -> Arc<Engine> {
        let options = EngineOptions {
            default_namespace: namespace.map(str::to_string),
            ..Default::default()
        };
        Arc::new(Engine::new(
            Arc::new(cluster.clone()),
            Arc::new(StaticDiscoverer::default()),
            options,
            &CancellationToken::new(),
            Handle::current(),
        ))
    }

    async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_lookup_does_not_arm_second_watch() {
        let cluster = MockClusterClient::new();
        cluster.add_endpoints("voice", "kamailio", &["10.0.0.1"]);
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        blocking(move || {
            e.endpoint_ips("kamailio", None).unwrap();
            e.endpoint_ips("kamailio", Some("voice")).unwrap();
            e.endpoints("other", None).unwrap_err();
        })
        .await;

        let key = WatchKey::new(ResourceKind::Endpoints, "voice");
        assert_eq!(cluster.watch_count(&key), 1);
        assert_eq!(engine.watches().state(&key), Some(WatchState::Armed));
        assert_eq!(engine.armed_watches(), vec![key]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_found_arms_watch() {
        let cluster = MockClusterClient::new();
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        let err = blocking(move || e.config_map("missing", None).unwrap_err()).await;

        assert!(matches!(
            err,
            ResolveError::Cluster(ClusterError::NotFound { .. })
        ));
        assert_eq!(
            cluster.watch_count(&WatchKey::new(ResourceKind::ConfigMap, "voice")),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_api_error_does_not_arm_watch() {
        let cluster = MockClusterClient::new();
        cluster.set_get_error("connection refused");
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        blocking(move || e.service("kamailio", None).unwrap_err()).await;

        assert_eq!(cluster.total_watch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_watches_after_first_render() {
        let cluster = MockClusterClient::new();
        cluster.add_service("voice", "kamailio", "10.96.0.20");
        let engine = engine(&cluster, Some("voice"));
        engine.set_first_render_completed();

        let e = Arc::clone(&engine);
        let svc = blocking(move || e.service("kamailio", None).unwrap()).await;

        assert_eq!(
            svc.spec.unwrap().cluster_ip.as_deref(),
            Some("10.96.0.20")
        );
        assert_eq!(cluster.total_watch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_namespace_unresolved() {
        let cluster = MockClusterClient::new();
        let engine = engine(&cluster, None);

        let e = Arc::clone(&engine);
        let err = blocking(move || e.endpoints("kamailio", None).unwrap_err()).await;

        assert!(matches!(err, ResolveError::NamespaceUnresolved { .. }));
        assert_eq!(cluster.get_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lookup_times_out() {
        let cluster = MockClusterClient::new();
        cluster.set_get_delay(Duration::from_secs(5));
        let options = EngineOptions {
            default_namespace: Some("voice".to_string()),
            api_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let engine = Arc::new(Engine::new(
            Arc::new(cluster.clone()),
            Arc::new(StaticDiscoverer::default()),
            options,
            &CancellationToken::new(),
            Handle::current(),
        ));

        let e = Arc::clone(&engine);
        let err = blocking(move || e.config_map("slow", None).unwrap_err()).await;

        assert!(matches!(err, ResolveError::Timeout { .. }));
        assert_eq!(cluster.total_watch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_and_env() {
        let cluster = MockClusterClient::new();
        let mut options = EngineOptions::default();
        options
            .env_overrides
            .insert("ARI_AUTOSECRET".to_string(), "s3cret".to_string());
        let engine = Arc::new(Engine::new(
            Arc::new(cluster),
            Arc::new(StaticDiscoverer::default()),
            options,
            &CancellationToken::new(),
            Handle::current(),
        ));

        let e = Arc::clone(&engine);
        let (ip, unsupported) =
            blocking(move || (e.network("PrivateV4"), e.network("gateway"))).await;

        assert_eq!(ip.unwrap(), "10.0.0.10");
        assert!(matches!(unsupported, Err(ResolveError::UnsupportedQuery(_))));
        assert_eq!(engine.env("ARI_AUTOSECRET"), "s3cret");
        assert_eq!(engine.env("KUBETEMPLATE_TEST_SURELY_UNSET"), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_reports_change() {
        let cluster = MockClusterClient::new();
        cluster.add_config_map("voice", "dialplan", &[("extensions", "100")]);
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        blocking(move || e.config_map("dialplan", None).unwrap()).await;
        assert!(!engine.is_dirty());

        cluster.trigger(&WatchKey::new(ResourceKind::ConfigMap, "voice"));
        engine.wait().await.unwrap();
        assert!(engine.is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_reports_closed_stream_as_change() {
        let cluster = MockClusterClient::new();
        cluster.add_service("voice", "kamailio", "10.96.0.20");
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        blocking(move || e.service("kamailio", None).unwrap()).await;

        let key = WatchKey::new(ResourceKind::Service, "voice");
        cluster.close(&key);
        engine.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_reports_watch_failure() {
        let cluster = MockClusterClient::new();
        cluster.add_service("voice", "kamailio", "10.96.0.20");
        let engine = engine(&cluster, Some("voice"));

        let e = Arc::clone(&engine);
        blocking(move || e.service("kamailio", None).unwrap()).await;

        let key = WatchKey::new(ResourceKind::Service, "voice");
        cluster.fail(&key, "410 Gone");
        let err = engine.wait().await.unwrap_err();
        assert!(matches!(err, EngineError::WatchFailed(msg) if msg.contains("410 Gone")));

        for _ in 0..100 {
            if engine.watches().state(&key) != Some(WatchState::Armed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.watches().state(&key), Some(WatchState::Failed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_cancels_wait() {
        let cluster = MockClusterClient::new();
        let engine = engine(&cluster, Some("voice"));
        engine.close();
        assert!(matches!(engine.wait().await, Err(EngineError::Cancelled)));
    }
}
