//! Debounced module reloads.
//!
//! Renders request a reload through a [`ReloadHandle`]; the [`Reloader`]
//! task waits until Asterisk reports ready, then runs at most one reload
//! pass per interval while a request is pending.

use crate::config::ModuleList;
use crate::error::ControllerError;
use ari_client::{AriClientTrait, AriError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How often readiness is polled
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadState {
    Idle,
    Pending,
    Reloading { rerequested: bool },
}

/// Cheap handle for requesting reloads.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    state: Arc<Mutex<ReloadState>>,
}

impl ReloadHandle {
    /// Marks a reload as pending. Never blocks on I/O.
    pub fn request(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = match *state {
            ReloadState::Idle | ReloadState::Pending => ReloadState::Pending,
            ReloadState::Reloading { .. } => ReloadState::Reloading { rerequested: true },
        };
    }
}

/// Issues module reloads over ARI.
pub struct Reloader {
    ari: Arc<dyn AriClientTrait>,
    modules: ModuleList,
    interval: Duration,
    ready_timeout: Duration,
    state: Arc<Mutex<ReloadState>>,
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader")
            .field("modules", &self.modules)
            .field("interval", &self.interval)
            .field("ready_timeout", &self.ready_timeout)
            .finish_non_exhaustive()
    }
}

impl Reloader {
    /// Creates an idle reloader.
    #[must_use]
    pub fn new(
        ari: Arc<dyn AriClientTrait>,
        modules: ModuleList,
        interval: Duration,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            ari,
            modules,
            interval,
            ready_timeout,
            state: Arc::new(Mutex::new(ReloadState::Idle)),
        }
    }

    /// Handle for requesting reloads.
    #[must_use]
    pub fn handle(&self) -> ReloadHandle {
        ReloadHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Waits for readiness, then reloads pending requests every interval until cancelled.
    ///
    /// # Errors
    /// [`ControllerError::NeverReady`] if Asterisk does not report ready in time.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            ready = self.wait_ready() => ready?,
        }
        info!("Asterisk is ready; reloading {} at most every {:?}", self.modules, self.interval);

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.maybe_reload().await,
            }
        }
    }

    async fn wait_ready(&self) -> Result<(), ControllerError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.ari.system_ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("Asterisk not ready yet"),
                Err(e) => debug!("Asterisk readiness check failed: {}", e),
            }
            if Instant::now() >= deadline {
                error!("Asterisk did not become ready within {:?}", self.ready_timeout);
                return Err(ControllerError::NeverReady(self.ready_timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Pending → Reloading. Returns `false` if nothing is pending.
    fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ReloadState::Pending {
            *state = ReloadState::Reloading { rerequested: false };
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = match *state {
            ReloadState::Reloading { rerequested: true } => ReloadState::Pending,
            _ => ReloadState::Idle,
        };
    }

    async fn maybe_reload(&self) {
        if !self.begin() {
            return;
        }
        if let Err(e) = self.reload_all().await {
            error!("Reload pass failed: {}", e);
        }
        self.finish();
    }

    async fn reload_all(&self) -> Result<(), AriError> {
        for module in self.modules.iter() {
            self.ari.reload_module(module).await?;
            info!("Reloaded {}", module);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ari_client::MockAriClient;

    fn reloader(ari: &MockAriClient, modules: &str) -> Reloader {
        Reloader::new(
            Arc::new(ari.clone()),
            ModuleList::parse(modules),
            Duration::from_secs(5),
            Duration::from_secs(600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_coalesce_into_one_pass_after_interval() {
        let ari = MockAriClient::ready();
        let reloader = reloader(&ari, "res_pjsip.so");
        let handle = reloader.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reloader.run(cancel.clone()));

        for _ in 0..5 {
            handle.request();
        }
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(ari.reloads().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ari.reloads(), vec!["res_pjsip.so"]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ari.reloads().len(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_aborts_pass_and_clears_pending() {
        let ari = MockAriClient::ready();
        ari.set_not_loaded("chan_pjsip.so");
        let reloader = reloader(&ari, "res_pjsip.so,chan_pjsip.so,app_voicemail.so");
        let handle = reloader.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reloader.run(cancel.clone()));

        handle.request();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ari.reloads(), vec!["res_pjsip.so", "chan_pjsip.so"]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ari.reloads().len(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_is_fatal_and_never_reloads() {
        let ari = MockAriClient::not_ready();
        let reloader = Reloader::new(
            Arc::new(ari.clone()),
            ModuleList::parse("res_pjsip.so"),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        reloader.handle().request();

        let err = reloader.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ControllerError::NeverReady(d) if d == Duration::from_secs(30)));
        assert!(err.is_fatal());
        assert!(ari.reloads().is_empty());
        assert!(ari.variable_reads() >= 30);
    }

    #[test]
    fn test_request_during_reload_is_kept() {
        let ari = MockAriClient::ready();
        let reloader = reloader(&ari, "res_pjsip.so");
        let handle = reloader.handle();

        handle.request();
        assert!(reloader.begin());
        handle.request();
        reloader.finish();

        assert!(reloader.begin());
        reloader.finish();
        assert!(!reloader.begin());
    }

    #[tokio::test]
    async fn test_cancel_before_ready_is_clean() {
        let ari = MockAriClient::not_ready();
        let reloader = reloader(&ari, "res_pjsip.so");
        let cancel = CancellationToken::new();
        cancel.cancel();
        reloader.run(cancel).await.unwrap();
    }
}
