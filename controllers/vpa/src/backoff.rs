//! Fibonacci backoff for reconciliation retries.
//!
//! The error policy in the watcher requeues failed reconciliations using this
//! sequence instead of a fixed interval, so a persistently failing apiserver
//! call backs off progressively without overwhelming the API.
//!
//! Sequence in minutes: 1m, 1m, 2m, 3m, 5m, 8m, 10m (max).

use std::time::Duration;

/// Fibonacci backoff calculator.
///
/// Each value is the sum of the previous two, computed in minutes and capped
/// at `max_minutes`, then returned as seconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    /// Create a new backoff with the given minimum and maximum values in minutes.
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result_seconds = self.current_minutes * 60;

        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = std::cmp::min(next_minutes, self.max_minutes);

        result_seconds
    }

    /// Get the next backoff as a `Duration` and advance the sequence.
    #[must_use]
    #[allow(dead_code)] // Utility method, may be useful in the future
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state after a successful reconciliation.
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}
