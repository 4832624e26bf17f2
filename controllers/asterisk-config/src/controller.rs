//! Main controller implementation.
//!
//! A [`Controller`] owns the clients for one run: it renders the tree,
//! starts the reloader and the optional source-secret watcher, then
//! re-renders with a fresh engine every time watched state changes.

use crate::config::{ArchiveSource, Config};
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::reloader::Reloader;
use crate::secret::ARI_SECRET_ENV;
use crate::watcher::watch_source_secret;
use ari_client::{ARI_USERNAME, AriClient, AriClientTrait};
use kubetemplate::{
    ClusterClient, Discoverer, Engine, EngineError, EngineOptions, KubeClusterClient, discoverer_for,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Renders and reloads until watched state stops being observable.
pub struct Controller {
    config: Arc<Config>,
    cluster: Arc<dyn ClusterClient>,
    discoverer: Arc<dyn Discoverer>,
    ari: Arc<dyn AriClientTrait>,
    ari_secret: String,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with fresh cluster, discovery and ARI clients.
    ///
    /// # Errors
    /// Returns an error if any client cannot be built.
    pub async fn new(config: Arc<Config>, ari_secret: String) -> Result<Self, ControllerError> {
        info!("Initializing asterisk-config controller");

        let cluster = KubeClusterClient::try_default().await?;
        let discoverer = discoverer_for(&config.cloud)?;
        let ari = AriClient::new(&config.ari_url, ARI_USERNAME, &ari_secret)?;

        Ok(Self::with_clients(
            config,
            Arc::new(cluster),
            discoverer,
            Arc::new(ari),
            ari_secret,
        ))
    }

    /// Creates a controller from existing clients.
    #[must_use]
    pub fn with_clients(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterClient>,
        discoverer: Arc<dyn Discoverer>,
        ari: Arc<dyn AriClientTrait>,
        ari_secret: String,
    ) -> Self {
        Self {
            config,
            cluster,
            discoverer,
            ari,
            ari_secret,
        }
    }

    fn engine(&self, cancel: &CancellationToken) -> Arc<Engine> {
        let options = EngineOptions {
            default_namespace: self.config.namespace.clone(),
            api_timeout: self.config.kube_api_timeout,
            env_overrides: HashMap::from([(ARI_SECRET_ENV.to_string(), self.ari_secret.clone())]),
        };
        Arc::new(Engine::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.discoverer),
            options,
            cancel,
            Handle::current(),
        ))
    }

    /// Runs until `cancel` fires or an error ends the run.
    ///
    /// Every background task started here is stopped when this returns.
    ///
    /// # Errors
    /// Any failed cycle, a failed watch, or a fatal reloader error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let cancel = cancel.child_token();
        let _guard = cancel.clone().drop_guard();
        let config = &self.config;

        let reloader = Reloader::new(
            Arc::clone(&self.ari),
            config.reload_modules.clone(),
            config.min_reload_interval,
            config.ari_ready_timeout,
        );
        let reload = reloader.handle();
        let mut reload_task = tokio::spawn(reloader.run(cancel.clone()));

        let reconciler = Reconciler::new(Arc::clone(&self.cluster), Arc::clone(config));
        let mut engine = self.engine(&cancel);
        reconciler.reconcile(&engine).await?;

        let source_changed = Arc::new(Notify::new());
        if let ArchiveSource::Secret { namespace, name, .. } = &config.source {
            tokio::spawn(watch_source_secret(
                Arc::clone(&self.cluster),
                namespace.clone(),
                name.clone(),
                Arc::clone(&source_changed),
                cancel.clone(),
            ));
        }
        reload.request();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                changed = engine.wait() => match changed {
                    Ok(()) => info!("Watched cluster state changed"),
                    Err(EngineError::Cancelled) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
                () = source_changed.notified() => info!("Source secret changed"),
                result = &mut reload_task => {
                    // the reloader only returns early on error or cancellation
                    return result?;
                }
            }

            engine.close();
            engine = self.engine(&cancel);
            reconciler.reconcile(&engine).await?;
            reload.request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::source::SOURCE_SECRET_KEY;
    use crate::test_utils::{test_config, write_file, write_zip};
    use ari_client::MockAriClient;
    use kubetemplate::mock::{MockClusterClient, StaticDiscoverer};
    use kubetemplate::{ResourceKind, WatchKey};
    use std::path::Path;
    use std::time::Duration;

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn read(path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn controller(config: Config, cluster: &MockClusterClient, ari: &MockAriClient) -> Arc<Controller> {
        Arc::new(Controller::with_clients(
            Arc::new(config),
            Arc::new(cluster.clone()),
            Arc::new(StaticDiscoverer::default()),
            Arc::new(ari.clone()),
            "generated".to_string(),
        ))
    }

    fn fast(mut config: Config) -> Config {
        config.min_reload_interval = Duration::from_millis(50);
        config.ari_ready_timeout = Duration::from_secs(5);
        config
    }

    fn spawn(
        controller: &Arc<Controller>,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), ControllerError>> {
        let controller = Arc::clone(controller);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(&cancel).await })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_change_renders_again_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast(test_config(dir.path()));
        write_file(
            &config.defaults_dir.join("pjsip.conf.tmpl"),
            "{% for ip in endpoint_ips(\"proxy\") %}{{ ip }}\n{% endfor %}secret={{ env(\"ARI_AUTOSECRET\") }}\n",
        );
        write_zip(&dir.path().join("source.zip"), &[("extensions.conf", Some("[default]\n"))]);
        let rendered = config.export_dir.join("pjsip.conf");
        let cluster = MockClusterClient::new();
        cluster.add_endpoints("voice", "proxy", &["10.1.0.1"]);
        let ari = MockAriClient::ready();
        let cancel = CancellationToken::new();
        let task = spawn(&controller(config, &cluster, &ari), &cancel);

        eventually("first render", || {
            read(&rendered).as_deref() == Some("10.1.0.1\nsecret=generated\n")
        })
        .await;
        eventually("first reload", || ari.reloads().len() == 1).await;

        cluster.add_endpoints("voice", "proxy", &["10.1.0.1", "10.1.0.2"]);
        cluster.trigger(&WatchKey::new(ResourceKind::Endpoints, "voice"));

        eventually("second render", || {
            read(&rendered).as_deref() == Some("10.1.0.1\n10.1.0.2\nsecret=generated\n")
        })
        .await;
        eventually("second reload", || ari.reloads().len() == 2).await;
        assert_eq!(cluster.watch_count(&WatchKey::new(ResourceKind::Endpoints, "voice")), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_failure_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast(test_config(dir.path()));
        write_file(&config.defaults_dir.join("a.conf.tmpl"), "{{ configmap(\"settings\").data.x }}\n");
        write_zip(&dir.path().join("source.zip"), &[]);
        let cluster = MockClusterClient::new();
        cluster.add_config_map("voice", "settings", &[("x", "1")]);
        let ari = MockAriClient::ready();
        let cancel = CancellationToken::new();
        let task = spawn(&controller(config, &cluster, &ari), &cancel);

        let key = WatchKey::new(ResourceKind::ConfigMap, "voice");
        eventually("watch armed", || cluster.watch_count(&key) == 1).await;
        cluster.fail(&key, "watch expired");

        let err = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ControllerError::Engine(EngineError::WatchFailed(_))));
        assert!(!err.is_fatal());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_never_ready_ends_run_fatally() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast(test_config(dir.path()));
        config.ari_ready_timeout = Duration::from_secs(1);
        write_file(&config.defaults_dir.join("modules.conf"), "[modules]\n");
        write_zip(&dir.path().join("source.zip"), &[]);
        let cluster = MockClusterClient::new();
        let ari = MockAriClient::not_ready();
        let cancel = CancellationToken::new();
        let task = spawn(&controller(config, &cluster, &ari), &cancel);

        let err = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(ari.reloads().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_source_secret_change_renders_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast(test_config(dir.path()));
        write_file(&config.defaults_dir.join("modules.conf"), "[modules]\n");
        config.source = ArchiveSource::Secret {
            namespace: "voice".to_string(),
            name: "pbx-config".to_string(),
            path: dir.path().join("from-secret.zip"),
        };
        let export = config.export_dir.clone();
        let staging = dir.path().join("staging.zip");
        let cluster = MockClusterClient::new();
        write_zip(&staging, &[("v1.conf", Some("1\n"))]);
        cluster.add_secret("voice", "pbx-config", SOURCE_SECRET_KEY, &std::fs::read(&staging).unwrap());
        let ari = MockAriClient::ready();
        let cancel = CancellationToken::new();
        let task = spawn(&controller(config, &cluster, &ari), &cancel);

        eventually("first render", || export.join("v1.conf").is_file()).await;
        eventually("secret watched", || {
            cluster.object_watch_count(ResourceKind::Secret, "voice", "pbx-config") == 1
        })
        .await;

        write_zip(&staging, &[("v2.conf", Some("2\n"))]);
        cluster.add_secret("voice", "pbx-config", SOURCE_SECRET_KEY, &std::fs::read(&staging).unwrap());
        cluster.trigger_object(ResourceKind::Secret, "voice", "pbx-config");

        eventually("second render", || read(&export.join("v2.conf")).as_deref() == Some("2\n")).await;
        assert!(!export.join("v1.conf").exists());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
