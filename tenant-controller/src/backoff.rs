//! Per work queue key exponential backoff for failed syncs.

use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Tracks consecutive failures per key and hands out exponentially growing
/// requeue delays: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }

    /// Record a failure of `key` and return the delay before the next attempt.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget the failures of `key`.
    pub fn reset(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}
