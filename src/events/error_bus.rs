//! Categorized error events with bounded history and recovery strategies.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::bus::{BusEvent, EventBus, SubscriptionId};
use crate::error::BoxError;

/// Default number of events kept in the history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Subsystem an error event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Camera,
    Detection,
    Stereo,
    Recording,
    Disk,
    Resource,
    Cleanup,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Camera => "camera",
            ErrorCategory::Detection => "detection",
            ErrorCategory::Stereo => "stereo",
            ErrorCategory::Recording => "recording",
            ErrorCategory::Disk => "disk",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Cleanup => "cleanup",
            ErrorCategory::System => "system",
        };
        f.write_str(name)
    }
}

/// How bad an error event is, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A published fault or state notification. Immutable once published.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    /// Component that raised the event
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub cause: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ErrorEvent {
    pub fn new(
        category: ErrorCategory,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            cause: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

impl BusEvent for ErrorEvent {
    type Kind = ErrorCategory;

    fn kind(&self) -> ErrorCategory {
        self.category
    }
}

/// What the system should do in response to a class of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Ignore,
    Retry,
    Restart,
    StopSession,
    Shutdown,
}

/// Recovery policy for a category/severity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RecoveryStrategy {
    pub fn new(action: RecoveryAction) -> Self {
        Self {
            action,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn retry(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            action: RecoveryAction::Retry,
            max_retries,
            retry_delay,
        }
    }
}

/// Aggregate counters kept by the error bus.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_severity: HashMap<Severity, u64>,
}

/// Publish/subscribe bus specialised for [`ErrorEvent`].
///
/// Every published event is logged at a level matching its severity,
/// recorded in a fixed-size history (oldest evicted first), counted, and
/// then dispatched synchronously to subscribers.
pub struct ErrorEventBus {
    bus: EventBus<ErrorEvent>,
    capacity: usize,
    history: Mutex<VecDeque<ErrorEvent>>,
    stats: Mutex<ErrorStats>,
    strategies: RwLock<HashMap<(ErrorCategory, Severity), RecoveryStrategy>>,
}

impl Default for ErrorEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ErrorEventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            bus: EventBus::new("error-bus"),
            capacity: history_capacity.max(1),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.max(1))),
            stats: Mutex::new(ErrorStats::default()),
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to events of a single category.
    pub fn subscribe<F>(&self, category: ErrorCategory, handler: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.bus.subscribe(category, handler)
    }

    /// Subscribe to events of every category.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.bus.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe_any(id)
    }

    /// Record and dispatch an event. Returns the number of handlers reached.
    pub fn publish(&self, event: ErrorEvent) -> usize {
        match event.severity {
            Severity::Info => log::info!("[{}] {}: {}", event.category, event.source, event.message),
            Severity::Warning => {
                log::warn!("[{}] {}: {}", event.category, event.source, event.message)
            }
            Severity::Error | Severity::Critical => log::error!(
                "[{}] {} ({:?}): {}{}",
                event.category,
                event.source,
                event.severity,
                event.message,
                event
                    .cause
                    .as_deref()
                    .map(|c| format!(" (cause: {})", c))
                    .unwrap_or_default()
            ),
        }

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total += 1;
            *stats.by_category.entry(event.category).or_insert(0) += 1;
            *stats.by_severity.entry(event.severity).or_insert(0) += 1;
        }

        self.bus.publish(&event)
    }

    /// Shorthand for building and publishing an event.
    pub fn report(
        &self,
        category: ErrorCategory,
        severity: Severity,
        source: &str,
        message: impl Into<String>,
    ) -> usize {
        self.publish(ErrorEvent::new(category, severity, source, message))
    }

    /// Most recent events, oldest first, optionally filtered by category.
    ///
    /// At most `limit` events are returned.
    pub fn get_history(&self, category: Option<ErrorCategory>, limit: usize) -> Vec<ErrorEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<ErrorEvent> = history
            .iter()
            .rev()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn history_capacity(&self) -> usize {
        self.capacity
    }

    /// Running count of events published for `category`.
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_category
            .get(&category)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Register the recovery policy for a category/severity pair.
    pub fn register_strategy(
        &self,
        category: ErrorCategory,
        severity: Severity,
        strategy: RecoveryStrategy,
    ) {
        self.strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((category, severity), strategy);
    }

    /// Recovery policy registered for the event's category and severity.
    pub fn recovery_for(&self, event: &ErrorEvent) -> Option<RecoveryStrategy> {
        self.strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(event.category, event.severity))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(category: ErrorCategory, msg: &str) -> ErrorEvent {
        ErrorEvent::new(category, Severity::Warning, "test", msg)
    }

    #[test]
    fn test_category_subscription_filters() {
        let bus = ErrorEventBus::default();
        let camera_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&camera_hits);
            bus.subscribe(ErrorCategory::Camera, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let hits = Arc::clone(&all_hits);
            bus.subscribe_all(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.publish(event(ErrorCategory::Camera, "a"));
        bus.publish(event(ErrorCategory::Disk, "b"));

        assert_eq!(camera_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let bus = ErrorEventBus::new(3);
        for i in 0..5 {
            bus.publish(event(ErrorCategory::Detection, &format!("e{}", i)));
        }
        let history = bus.get_history(None, 10);
        let messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
        assert_eq!(bus.count(ErrorCategory::Detection), 5);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let bus = ErrorEventBus::default();
        bus.publish(event(ErrorCategory::Camera, "c1"));
        bus.publish(event(ErrorCategory::Disk, "d1"));
        bus.publish(event(ErrorCategory::Camera, "c2"));
        bus.publish(event(ErrorCategory::Camera, "c3"));

        let cams = bus.get_history(Some(ErrorCategory::Camera), 2);
        let messages: Vec<_> = cams.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["c2", "c3"]);
        assert!(bus.get_history(Some(ErrorCategory::Cleanup), 10).is_empty());
    }

    #[test]
    fn test_handler_sees_event_in_history() {
        let bus = Arc::new(ErrorEventBus::default());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let inner = Arc::clone(&bus);
            let seen = Arc::clone(&seen);
            bus.subscribe_all(move |_| {
                seen.store(inner.get_history(None, 100).len(), Ordering::SeqCst);
                Ok(())
            });
        }
        bus.publish(event(ErrorCategory::System, "x"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_by_severity() {
        let bus = ErrorEventBus::default();
        bus.report(ErrorCategory::Resource, Severity::Warning, "monitor", "cpu high");
        bus.report(ErrorCategory::Resource, Severity::Critical, "monitor", "cpu very high");
        let stats = bus.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_severity.get(&Severity::Critical), Some(&1));
        assert_eq!(stats.by_category.get(&ErrorCategory::Resource), Some(&2));
    }

    #[test]
    fn test_recovery_strategy_lookup() {
        let bus = ErrorEventBus::default();
        bus.register_strategy(
            ErrorCategory::Disk,
            Severity::Critical,
            RecoveryStrategy::new(RecoveryAction::StopSession),
        );
        let critical = ErrorEvent::new(ErrorCategory::Disk, Severity::Critical, "rec", "full");
        let warning = ErrorEvent::new(ErrorCategory::Disk, Severity::Warning, "rec", "low");
        assert_eq!(
            bus.recovery_for(&critical).map(|s| s.action),
            Some(RecoveryAction::StopSession)
        );
        assert!(bus.recovery_for(&warning).is_none());
    }

    #[test]
    fn test_event_serializes() {
        let event = ErrorEvent::new(ErrorCategory::Camera, Severity::Critical, "reconnect", "gone")
            .with_cause("usb reset")
            .with_meta("camera", "left");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "camera");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["cause"], "usb reset");
        assert_eq!(json["metadata"]["camera"], "left");
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ErrorEventBus::default();
        let id = bus.subscribe(ErrorCategory::Camera, |_| Ok(()));
        assert!(bus.unsubscribe(id));
        assert_eq!(bus.report(ErrorCategory::Camera, Severity::Info, "t", "m"), 0);
    }
}
