//! Per-job progress throttling.
//!
//! Rate-limits progress dispatch so a chatty downloader cannot flood a
//! receiver: at most one progress event per job per configured interval.
//! Buckets are keyed by job id and released when the job goes terminal.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Keyed rate-limiter for progress events.
pub struct ProgressGate {
    buckets: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl ProgressGate {
    /// Create a gate with the specified minimum interval per key.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    /// Check whether `key` may emit now, recording the emission if so.
    ///
    /// The first call for a key always passes.
    pub fn should_emit(&self, key: &str) -> bool {
        // A zero interval disables throttling entirely.
        if self.min_interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match buckets.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                buckets.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop the bucket for a key. The next emission for it passes
    /// immediately.
    pub fn release(&self, key: &str) {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no buckets are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
