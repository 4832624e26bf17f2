//! Source secret watcher.
//!
//! Watches the Secret holding the custom archive and wakes the controller
//! whenever it changes. Watch failures are logged and the watch is
//! re-established after a pause.

use futures::StreamExt;
use kubetemplate::{ClusterClient, ResourceKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before re-establishing a failed or closed watch
pub const REWATCH_DELAY: Duration = Duration::from_secs(5);

/// Watches the source secret until `cancel` fires, notifying `changed` on every change.
pub async fn watch_source_secret(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    changed: Arc<Notify>,
    cancel: CancellationToken,
) {
    info!("Watching source secret {}/{}", namespace, name);
    loop {
        let mut stream = cluster.watch_object(ResourceKind::Secret, &namespace, &name);
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(())) => {
                    debug!("Source secret {}/{} changed", namespace, name);
                    changed.notify_one();
                }
                Some(Err(e)) => {
                    warn!("Source secret watch failed: {}", e);
                    break;
                }
                None => {
                    warn!("Source secret watch closed");
                    break;
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(REWATCH_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetemplate::mock::MockClusterClient;

    fn spawn(cluster: &MockClusterClient, changed: &Arc<Notify>, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(watch_source_secret(
            Arc::new(cluster.clone()),
            "voice".to_string(),
            "pbx-config".to_string(),
            Arc::clone(changed),
            cancel.clone(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_notifies() {
        let cluster = MockClusterClient::new();
        let changed = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = spawn(&cluster, &changed, &cancel);
        tokio::time::sleep(Duration::from_millis(10)).await;

        cluster.trigger_object(ResourceKind::Secret, "voice", "pbx-config");

        tokio::time::timeout(Duration::from_secs(1), changed.notified())
            .await
            .unwrap();
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watch_is_reestablished_after_delay() {
        let cluster = MockClusterClient::new();
        let changed = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = spawn(&cluster, &changed, &cancel);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cluster.object_watch_count(ResourceKind::Secret, "voice", "pbx-config"), 1);

        cluster.close_object(ResourceKind::Secret, "voice", "pbx-config");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cluster.object_watch_count(ResourceKind::Secret, "voice", "pbx-config"), 1);

        tokio::time::sleep(REWATCH_DELAY).await;
        assert_eq!(cluster.object_watch_count(ResourceKind::Secret, "voice", "pbx-config"), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
