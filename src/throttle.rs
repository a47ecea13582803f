//! Keyed time-based throttling.
//!
//! Used for rate-limited logging in the hot path and for cool-down windows
//! on repeated alerts.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default window for rate-limited log lines.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Lets an action through at most once per `interval` for each key.
#[derive(Debug)]
pub struct Throttle<K> {
    interval: Duration,
    last: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash> Throttle<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true if the action for `key` may run now, and records it.
    pub fn ready(&self, key: K) -> bool {
        self.ready_at(key, Instant::now(), self.interval)
    }

    /// Like [`Throttle::ready`] but with a per-call cool-down.
    pub fn ready_with(&self, key: K, cooldown: Duration) -> bool {
        self.ready_at(key, Instant::now(), cooldown)
    }

    fn ready_at(&self, key: K, now: Instant, cooldown: Duration) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(&key) {
            Some(prev) if now.saturating_duration_since(*prev) < cooldown => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Forget the history of `key` so the next call passes.
    pub fn reset(&self, key: &K) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
