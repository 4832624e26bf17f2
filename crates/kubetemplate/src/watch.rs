//! Watch registry
//!
//! Tracks the resource watches armed by an [`Engine`](crate::Engine) and
//! collapses everything they report into one level-triggered change signal.

use crate::cluster::{ChangeStream, ClusterClient, WatchKey};
use crate::error::EngineError;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a single armed watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Consumer task is running
    Armed,
    /// Reported a change or its stream ended
    Closed,
    /// Stream reported an error
    Failed,
}

/// Coalesced state of every watch in a registry.
///
/// `Failed` is sticky: once a watch breaks, later changes do not hide it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeState {
    /// Nothing has changed since the engine was built
    Clean,
    /// At least one watched resource changed
    Changed,
    /// A watch failed
    Failed(String),
}

fn mark_changed(signal: &watch::Sender<ChangeState>) {
    signal.send_if_modified(|state| {
        if *state == ChangeState::Clean {
            *state = ChangeState::Changed;
            true
        } else {
            false
        }
    });
}

fn mark_failed(signal: &watch::Sender<ChangeState>, reason: String) {
    signal.send_if_modified(|state| {
        if matches!(state, ChangeState::Failed(_)) {
            false
        } else {
            *state = ChangeState::Failed(reason);
            true
        }
    });
}

/// One watch per [`WatchKey`], each consumed by its own task.
#[derive(Debug)]
pub struct WatchRegistry {
    watches: Arc<Mutex<HashMap<WatchKey, WatchState>>>,
    signal: Arc<watch::Sender<ChangeState>>,
    cancel: CancellationToken,
}

impl WatchRegistry {
    /// Creates an empty registry whose tasks stop when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let (signal, _) = watch::channel(ChangeState::Clean);
        Self {
            watches: Arc::new(Mutex::new(HashMap::new())),
            signal: Arc::new(signal),
            cancel,
        }
    }

    /// Arms a watch for `key` unless one was armed before.
    ///
    /// Returns `true` if this call armed it.
    pub fn arm(&self, key: &WatchKey, cluster: &dyn ClusterClient, runtime: &Handle) -> bool {
        let stream = {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            if watches.contains_key(key) {
                return false;
            }
            watches.insert(key.clone(), WatchState::Armed);
            cluster.watch(key)
        };

        info!("Armed watch for {}", key);
        runtime.spawn(consume(
            key.clone(),
            stream,
            Arc::clone(&self.watches),
            Arc::clone(&self.signal),
            self.cancel.clone(),
        ));
        true
    }

    /// Keys with a registered watch, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<WatchKey> {
        let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<WatchKey> = watches.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current state of the watch for `key`, if any.
    #[must_use]
    pub fn state(&self, key: &WatchKey) -> Option<WatchState> {
        let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.get(key).copied()
    }

    /// Current coalesced state.
    #[must_use]
    pub fn change_state(&self) -> ChangeState {
        self.signal.borrow().clone()
    }

    /// Waits until any watch reports a change (`Ok`) or fails (`Err`).
    ///
    /// # Errors
    /// [`EngineError::WatchFailed`] when a watch broke,
    /// [`EngineError::Cancelled`] when the registry's token fired first.
    pub async fn wait(&self) -> Result<(), EngineError> {
        let mut rx = self.signal.subscribe();
        let changed = async move {
            rx.wait_for(|state| *state != ChangeState::Clean)
                .await
                .map(|state| state.clone())
        };

        tokio::select! {
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
            state = changed => match state {
                Ok(ChangeState::Failed(reason)) => Err(EngineError::WatchFailed(reason)),
                Ok(_) => Ok(()),
                Err(_) => Err(EngineError::Cancelled),
            },
        }
    }
}

async fn consume(
    key: WatchKey,
    mut stream: ChangeStream,
    watches: Arc<Mutex<HashMap<WatchKey, WatchState>>>,
    signal: Arc<watch::Sender<ChangeState>>,
    cancel: CancellationToken,
) {
    let event = tokio::select! {
        () = cancel.cancelled() => {
            debug!("Watch for {} cancelled", key);
            return;
        }
        event = stream.next() => event,
    };

    let state = match event {
        Some(Ok(())) => {
            info!("Change detected on {}", key);
            mark_changed(&signal);
            WatchState::Closed
        }
        None => {
            info!("Watch for {} closed", key);
            mark_changed(&signal);
            WatchState::Closed
        }
        Some(Err(e)) => {
            warn!("Watch for {} failed: {}", key, e);
            mark_failed(&signal, format!("{key}: {e}"));
            WatchState::Failed
        }
    };

    watches
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, state);
}
