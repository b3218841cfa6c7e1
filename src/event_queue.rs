//! Bounded, chronologically-ordered event queue shared between a
//! session's feeder thread(s) and its worker thread.
//!
//! Ordered by `(timestamp_ns, sequence)`; sequence is assigned here so
//! ties between events pushed in the same instant still resolve
//! deterministically in push order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};

use crate::messages::MarketEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Block,
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block
    }
}

struct HeapEntry(MarketEvent);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp_ns == other.0.timestamp_ns && self.0.sequence == other.0.sequence
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) pops the smallest (ts, seq) first.
        (other.0.timestamp_ns, other.0.sequence).cmp(&(self.0.timestamp_ns, self.0.sequence))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    stopped: bool,
    dropped: u64,
}

/// A bounded priority queue of [`MarketEvent`]s. `capacity == 0` means unbounded.
pub struct EventQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    next_seq: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                stopped: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            capacity,
            policy,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Pushes an event, assigning it the next sequence number. Returns
    /// `false` if the queue was full under the `Block` policy.
    pub fn push(&self, mut event: MarketEvent) -> bool {
        event.sequence = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut guard = self.inner.lock().unwrap();
        if self.capacity > 0 && guard.heap.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => {
                    guard.dropped += 1;
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    // pop() already yields the smallest (ts, seq) first
                    // under our reversed Ord, i.e. the oldest event.
                    guard.heap.pop();
                    guard.dropped += 1;
                }
            }
        }
        guard.heap.push(HeapEntry(event));
        self.not_empty.notify_one();
        true
    }

    pub fn pop(&self) -> Option<MarketEvent> {
        let mut guard = self.inner.lock().unwrap();
        guard.heap.pop().map(|e| e.0)
    }

    /// Blocks until an event is available or the queue is stopped.
    pub fn wait_and_pop(&self) -> Option<MarketEvent> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(e) = guard.heap.pop() {
                return Some(e.0);
            }
            if guard.stopped {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    pub fn peek(&self) -> Option<MarketEvent> {
        let guard = self.inner.lock().unwrap();
        guard.heap.peek().map(|e| e.0.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.heap.clear();
        guard.dropped = 0;
    }

    /// Wakes every waiter with `None`. Idempotent.
    pub fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.stopped = true;
        self.not_empty.notify_all();
    }

    /// Re-arms the queue without clearing its contents.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.stopped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EventKind, EventPayload};

    fn ev(ts: i64) -> MarketEvent {
        MarketEvent {
            timestamp_ns: ts,
            sequence: 0,
            kind: EventKind::Trade,
            symbol: "AAPL".to_string(),
            payload: EventPayload::None,
        }
    }

    #[test]
    fn pops_in_timestamp_order() {
        let q = EventQueue::new(0, OverflowPolicy::Block);
        q.push(ev(30));
        q.push(ev(10));
        q.push(ev(20));
        assert_eq!(q.pop().unwrap().timestamp_ns, 10);
        assert_eq!(q.pop().unwrap().timestamp_ns, 20);
        assert_eq!(q.pop().unwrap().timestamp_ns, 30);
    }

    #[test]
    fn ties_broken_by_push_order() {
        let q = EventQueue::new(0, OverflowPolicy::Block);
        q.push(ev(10));
        q.push(ev(10));
        let first = q.pop().unwrap();
        let second = q.pop().unwrap();
        assert!(first.sequence < second.sequence);
    }

    #[test]
    fn block_policy_drops_and_counts() {
        let q = EventQueue::new(2, OverflowPolicy::Block);
        assert!(q.push(ev(1)));
        assert!(q.push(ev(2)));
        assert!(!q.push(ev(3)));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn drop_oldest_keeps_newest_k() {
        let q = EventQueue::new(2, OverflowPolicy::DropOldest);
        q.push(ev(1));
        q.push(ev(2));
        q.push(ev(3));
        assert_eq!(q.size(), 2);
        assert_eq!(q.pop().unwrap().timestamp_ns, 2);
        assert_eq!(q.pop().unwrap().timestamp_ns, 3);
    }

    #[test]
    fn stop_wakes_waiter_with_none() {
        use std::sync::Arc;
        use std::thread;
        let q = Arc::new(EventQueue::new(0, OverflowPolicy::Block));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_and_pop());
        thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(handle.join().unwrap().is_none());
    }
}
