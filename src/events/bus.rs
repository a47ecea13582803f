//! Generic synchronous publish/subscribe dispatcher.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::BoxError;

/// An event that can travel over an [`EventBus`].
///
/// The kind is the static tag subscribers register against.
pub trait BusEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Callback invoked for every matching event.
pub type Handler<E> = Arc<dyn Fn(&E) -> Result<(), BoxError> + Send + Sync>;

/// Handle returned by `subscribe`, needed to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry<E: BusEvent> {
    by_kind: HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>,
    wildcard: Vec<(SubscriptionId, Handler<E>)>,
}

/// Publish counters for diagnostics.
#[derive(Debug, Clone)]
pub struct EventBusStats<K> {
    pub published: HashMap<K, u64>,
    pub handler_failures: u64,
}

/// Synchronous typed event dispatcher.
///
/// `publish` snapshots the handler list under the lock, releases it, then
/// runs every handler on the caller's thread. A failing or panicking handler
/// is logged and skipped; it never reaches the publisher or the other
/// subscribers. Handlers must be fast: a slow handler stalls the publisher.
pub struct EventBus<E: BusEvent> {
    name: &'static str,
    registry: Mutex<Registry<E>>,
    published: Mutex<HashMap<E::Kind, u64>>,
    next_id: AtomicU64,
    handler_failures: AtomicU64,
}

impl<E: BusEvent> EventBus<E> {
    /// Create an empty bus. `name` prefixes log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Mutex::new(Registry {
                by_kind: HashMap::new(),
                wildcard: Vec::new(),
            }),
            published: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler_failures: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to one kind of event.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry()
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event regardless of kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry().wildcard.push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription made with [`EventBus::subscribe`].
    ///
    /// Returns false if no such subscription exists for `kind`.
    pub fn unsubscribe(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(handlers) = registry.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.by_kind.remove(&kind);
        }
        removed
    }

    /// Remove a subscription by id alone, whatever it was registered for.
    pub fn unsubscribe_any(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let before = registry.wildcard.len();
        registry.wildcard.retain(|(sid, _)| *sid != id);
        if registry.wildcard.len() != before {
            return true;
        }
        let mut removed = false;
        registry.by_kind.retain(|_, handlers| {
            let len = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != len;
            !handlers.is_empty()
        });
        removed
    }

    /// Deliver `event` to every current subscriber of its kind.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        {
            let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
            *published.entry(kind).or_insert(0) += 1;
        }

        let handlers: Vec<Handler<E>> = {
            let registry = self.registry();
            registry
                .by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{}] handler for {:?} failed: {}", self.name, kind, e);
                }
                Err(_) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("[{}] handler for {:?} panicked", self.name, kind);
                }
            }
        }
        delivered
    }

    /// Number of subscribers that would receive an event of `kind`.
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        let registry = self.registry();
        registry.by_kind.get(&kind).map_or(0, Vec::len) + registry.wildcard.len()
    }

    /// Snapshot of publish counters.
    pub fn stats(&self) -> EventBusStats<E::Kind> {
        EventBusStats {
            published: self
                .published
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Msg(Kind, u32);

    impl BusEvent for Msg {
        type Kind = Kind;
        fn kind(&self) -> Kind {
            self.0
        }
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> impl Fn(&Msg) -> Result<(), BoxError> {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus: EventBus<Msg> = EventBus::new("test");
        assert_eq!(bus.publish(&Msg(Kind::Ping, 1)), 0);
        assert_eq!(bus.stats().published.get(&Kind::Ping), Some(&1));
    }

    #[test]
    fn test_publish_reaches_only_matching_kind() {
        let bus = EventBus::new("test");
        let pings = Arc::new(AtomicUsize::new(0));
        let pongs = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Kind::Ping, counter_handler(&pings));
        bus.subscribe(Kind::Pong, counter_handler(&pongs));

        bus.publish(&Msg(Kind::Ping, 1));
        bus.publish(&Msg(Kind::Ping, 2));

        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(pongs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let bus = EventBus::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Kind::Ping, counter_handler(&hits));
        bus.subscribe(Kind::Ping, |_: &Msg| Err("boom".into()));
        bus.subscribe(Kind::Ping, |_: &Msg| -> Result<(), BoxError> { panic!("handler panic") });
        bus.subscribe(Kind::Ping, counter_handler(&hits));

        let delivered = bus.publish(&Msg(Kind::Ping, 1));

        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(Kind::Ping, counter_handler(&hits));

        assert!(!bus.unsubscribe(Kind::Pong, id));
        assert!(bus.unsubscribe(Kind::Ping, id));
        assert!(!bus.unsubscribe(Kind::Ping, id));

        bus.publish(&Msg(Kind::Ping, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(Kind::Ping), 0);
    }

    #[test]
    fn test_wildcard_subscription() {
        let bus = EventBus::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe_all(counter_handler(&hits));

        bus.publish(&Msg(Kind::Ping, 1));
        bus.publish(&Msg(Kind::Pong, 2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(bus.unsubscribe_any(id));
        bus.publish(&Msg(Kind::Pong, 3));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new("test"));
        let inner = Arc::clone(&bus);
        bus.subscribe(Kind::Ping, move |_: &Msg| {
            inner.subscribe(Kind::Pong, |_: &Msg| Ok(()));
            Ok(())
        });

        bus.publish(&Msg(Kind::Ping, 1));
        assert_eq!(bus.subscriber_count(Kind::Pong), 1);
    }

    #[test]
    fn test_payload_visible_to_handler() {
        let bus = EventBus::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(Kind::Pong, move |msg: &Msg| {
            sink.lock().unwrap().push(msg.1);
            Ok(())
        });

        bus.publish(&Msg(Kind::Pong, 41));
        bus.publish(&Msg(Kind::Pong, 42));
        assert_eq!(*seen.lock().unwrap(), vec![41, 42]);
    }
}
