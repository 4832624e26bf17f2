//! asterisk-config
//!
//! Sidecar that keeps an Asterisk configuration tree in sync with the
//! cluster:
//! - renders `*.tmpl` files from the defaults and custom roots into the export root
//! - watches every Kubernetes resource the templates read
//! - re-renders on change and reloads the configured Asterisk modules over ARI

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod reloader;
mod secret;
mod supervisor;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::supervisor::{RestartPolicy, supervise};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_LOG_FILTER: &str = "asterisk_config=info,kubetemplate=info,ari_client=info";

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        error!("rustls crypto provider was already installed");
    }

    info!("Starting asterisk-config");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Source: {}", config.source);
    info!("  Defaults: {}", config.defaults_dir.display());
    info!("  Custom: {}", config.custom_dir.display());
    info!("  Export: {}", config.export_dir.display());
    info!("  Reload modules: {}", config.reload_modules);
    if config.reload_modules.is_empty() {
        warn!("No reload modules configured; rendered changes will not be applied");
    }
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("(unset)")
    );

    create_dir(&config.custom_dir).await?;
    create_dir(&config.export_dir).await?;
    let ari_secret = secret::get_or_create(config.ari_secret.as_deref(), &config.export_dir).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let config = Arc::new(config);
    let policy = RestartPolicy::from_config(&config);
    supervise(policy, &cancel, || {
        let config = Arc::clone(&config);
        let ari_secret = ari_secret.clone();
        let cancel = cancel.clone();
        async move {
            let controller = Controller::new(config, ari_secret).await?;
            controller.run(&cancel).await
        }
    })
    .await
}

async fn create_dir(path: &Path) -> Result<(), ControllerError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(ControllerError::file("Failed to create", path))
}

/// Cancels `cancel` on SIGTERM or SIGINT.
async fn shutdown_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    cancel.cancel();
}
