//! Process-level restart loop.
//!
//! Each run builds fresh clients and ends on the first error. Runs shorter
//! than the minimum runtime count as short deaths and are followed by a
//! Fibonacci backoff; too many in a row ends the process.

use crate::backoff::{FibonacciBackoff, ShortDeathCounter};
use crate::config::Config;
use crate::error::ControllerError;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// When to restart and when to give up.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Counts consecutive short runs
    pub deaths: ShortDeathCounter,
    /// Delay after a short run
    pub backoff: FibonacciBackoff,
}

impl RestartPolicy {
    /// Policy from the configured minimum runtime and short-death limit.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            deaths: ShortDeathCounter::new(config.min_runtime, config.max_short_deaths),
            backoff: FibonacciBackoff::default(),
        }
    }
}

/// Calls `run` until it is cancelled, fails fatally, or dies short too often.
///
/// # Errors
/// A fatal error from a run, or [`ControllerError::CrashLoop`] with the
/// error that ended the last run.
pub async fn supervise<F, Fut>(
    mut policy: RestartPolicy,
    cancel: &CancellationToken,
    mut run: F,
) -> Result<(), ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ControllerError>>,
{
    loop {
        let started = Instant::now();
        let result = run().await;
        if cancel.is_cancelled() {
            info!("Shutting down");
            return Ok(());
        }

        let err = match result {
            Err(e) if e.is_fatal() => {
                error!("Fatal error: {}", e);
                return Err(e);
            }
            Err(e) => e,
            Ok(()) => ControllerError::Task("run ended without an error".to_string()),
        };
        let runtime = started.elapsed();

        if !policy.deaths.record(runtime) {
            warn!("Run ended after {:?}: {}; restarting", runtime, err);
            policy.backoff.reset();
            continue;
        }

        if policy.deaths.exhausted() {
            error!("Run died {} times in a row; giving up", policy.deaths.deaths());
            return Err(ControllerError::CrashLoop {
                deaths: policy.deaths.deaths(),
                last: Box::new(err),
            });
        }

        let delay = policy.backoff.next_backoff();
        warn!(
            "Run ended after {:?} ({} short in a row): {}; restarting in {:?}",
            runtime,
            policy.deaths.deaths(),
            err,
            delay
        );
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Shutting down");
                return Ok(());
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
