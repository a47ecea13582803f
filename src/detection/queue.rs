//! Bounded queue with drop-oldest backpressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// What happened to an item handed to [`DropOldestQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without evicting anything
    Queued,
    /// The queue was full; the oldest item was evicted to make room
    ReplacedOldest,
    /// The queue was full and the retry after eviction also failed
    Lost,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        self != PushOutcome::Queued
    }
}

/// Fixed-capacity FIFO that evicts its oldest item when full.
///
/// Both channel ends are owned by the queue so a producer can evict from
/// the front. `dropped` counts every item that did not make it through,
/// evicted or lost; `lost` counts only failed retries.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
    lost: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Non-blocking put; on a full queue evicts the oldest item and retries once.
    pub fn push(&self, item: T) -> PushOutcome {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        let item = match self.try_send(item) {
            Ok(()) => return PushOutcome::Queued,
            Err(item) => item,
        };
        // A consumer may have made room since the first attempt
        let item = match self.try_send(item) {
            Ok(()) => return PushOutcome::Queued,
            Err(item) => item,
        };

        if self.rx.try_recv().is_ok() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::ReplacedOldest,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.lost.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Lost
            }
        }
    }

    fn try_send(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
        })
    }

    /// Take the oldest item if one is queued.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let queue = DropOldestQueue::new(3);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_overflow_keeps_most_recent() {
        let capacity = 4;
        let queue = DropOldestQueue::new(capacity);
        for i in 0..25 {
            let outcome = queue.push(i);
            assert!(queue.len() <= capacity);
            if i >= capacity as i32 {
                assert_eq!(outcome, PushOutcome::ReplacedOldest);
            }
        }
        assert_eq!(queue.drain(), vec![21, 22, 23, 24]);
        assert_eq!(queue.dropped(), 21);
        assert_eq!(queue.lost(), 0);
        assert_eq!(queue.pushed(), 25);
    }

    #[test]
    fn test_contents_are_suffix_after_every_push() {
        let queue = DropOldestQueue::new(3);
        let mut expected = std::collections::VecDeque::new();
        for i in 0..10 {
            queue.push(i);
            expected.push_back(i);
            if expected.len() > 3 {
                expected.pop_front();
            }
            let snapshot = queue.drain();
            assert_eq!(snapshot, expected.iter().copied().collect::<Vec<_>>());
            for item in snapshot {
                queue.push(item);
            }
        }
    }

    #[test]
    fn test_pop_timeout_empty() {
        let queue: DropOldestQueue<u8> = DropOldestQueue::new(1);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = DropOldestQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push('a');
        queue.push('b');
        assert_eq!(queue.try_pop(), Some('b'));
    }

    #[test]
    fn test_concurrent_consumer_accounting() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(DropOldestQueue::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let consumer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match queue.pop_timeout(Duration::from_millis(10)) {
                        Some(item) => seen.push(item),
                        None if done.load(Ordering::SeqCst) => break,
                        None => {}
                    }
                }
                seen
            })
        };
        for i in 0..2_000u32 {
            queue.push(i);
        }
        done.store(true, Ordering::SeqCst);
        let seen = consumer.join().unwrap();

        // Every item is consumed or counted as dropped, never both
        assert_eq!(seen.len() as u64 + queue.dropped(), 2_000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_outcome_dropped() {
        assert!(!PushOutcome::Queued.dropped());
        assert!(PushOutcome::ReplacedOldest.dropped());
        assert!(PushOutcome::Lost.dropped());
    }
}
