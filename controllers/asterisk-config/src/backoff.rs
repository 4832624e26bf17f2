//! # Restart Backoff
//!
//! Fibonacci backoff between supervisor restarts, and the short-death
//! counter that decides when to stop restarting.
//!
//! Sequence with the defaults: 60s, 60s, 120s, 180s, 300s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff (for reset)
    min: Duration,
    /// Previous backoff value
    prev: Duration,
    /// Current backoff value
    current: Duration,
    /// Maximum backoff value
    max: Duration,
}

impl Default for FibonacciBackoff {
    /// 60s minimum, 300s maximum
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given bounds
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// Counts consecutive runs shorter than a minimum runtime.
#[derive(Debug, Clone)]
pub struct ShortDeathCounter {
    min_runtime: Duration,
    max_deaths: u32,
    deaths: u32,
}

impl ShortDeathCounter {
    /// Create a counter that gives up after `max_deaths` runs shorter than `min_runtime`
    #[must_use]
    pub fn new(min_runtime: Duration, max_deaths: u32) -> Self {
        Self {
            min_runtime,
            max_deaths,
            deaths: 0,
        }
    }

    /// Records a finished run. Returns `true` if it was a short death.
    pub fn record(&mut self, runtime: Duration) -> bool {
        if runtime < self.min_runtime {
            self.deaths += 1;
            true
        } else {
            self.deaths = 0;
            false
        }
    }

    /// Consecutive short deaths so far
    #[must_use]
    pub fn deaths(&self) -> u32 {
        self.deaths
    }

    /// Whether the limit has been reached
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.deaths >= self.max_deaths
    }
}
