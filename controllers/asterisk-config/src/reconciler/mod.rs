//! Reconciliation cycle.
//!
//! One cycle takes the export root from whatever it held to a complete,
//! freshly rendered configuration:
//! - `source`: materialize, download and extract the custom archive
//! - `tree`: learn and render passes over the template roots

pub mod source;
pub mod tree;

use crate::config::{ArchiveSource, Config};
use crate::error::ControllerError;
use kubetemplate::{ClusterClient, Engine, RenderMode, TemplateRenderer};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Files processed by the learn pass
    pub learned: usize,
    /// Files processed by the render pass
    pub rendered: usize,
    /// Watches armed during the learn pass
    pub watches: usize,
}

/// Runs render cycles against a cluster.
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<Config>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Arc<Config>) -> Self {
        Self { cluster, config }
    }

    /// Runs one full cycle with `engine`, which must be fresh.
    ///
    /// Steps, each aborting the cycle on failure: materialize the source
    /// secret, clear the export root, replace the custom root with the
    /// archive's contents, learn pass, render pass, completion marker.
    ///
    /// # Errors
    /// Any step's error.
    pub async fn reconcile(&self, engine: &Arc<Engine>) -> Result<CycleSummary, ControllerError> {
        let config = &self.config;

        let archive = match &config.source {
            ArchiveSource::Secret {
                namespace,
                name,
                path,
            } => {
                source::materialize_secret(self.cluster.as_ref(), namespace, name, path).await?;
                path.display().to_string()
            }
            ArchiveSource::Local(path) => path.display().to_string(),
            ArchiveSource::Remote(url) => url.clone(),
        };

        tree::clear_export_dir(&config.export_dir).await?;

        let location = source::fetch_archive(&archive, &config.source_auth).await?;
        tree::clear_custom_dir(&config.custom_dir).await?;
        source::extract(location.path(), &config.custom_dir).await?;
        drop(location);

        let renderer = TemplateRenderer::new(engine);
        let engine_ref = Arc::clone(engine);
        let defaults = config.defaults_dir.clone();
        let custom = config.custom_dir.clone();
        let export = config.export_dir.clone();
        let (learned, rendered) = tokio::task::spawn_blocking(move || {
            let roots: [&Path; 2] = [&defaults, &custom];
            let learned = tree::run_pass(&renderer, &roots, &export, RenderMode::Learn)?;
            engine_ref.set_first_render_completed();
            let rendered = tree::run_pass(&renderer, &roots, &export, RenderMode::Render)?;
            Ok::<_, ControllerError>((learned, rendered))
        })
        .await??;

        tree::write_completion_marker(&config.export_dir).await?;

        let summary = CycleSummary {
            learned,
            rendered,
            watches: engine.armed_watches().len(),
        };
        info!(
            "Rendered {} files into {} with {} watches armed",
            summary.rendered,
            config.export_dir.display(),
            summary.watches
        );
        Ok(summary)
    }
}
