use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// A delay queue: items become available for `pop` once their scheduled
/// instant arrives, earliest first. Hand-rolled rather than built on
/// `tokio_util::time::DelayQueue`, since that type's `insert` from
/// multiple producers while another task is polling `next()` is not
/// something this crate wants to rely on without being able to verify it
/// against a running binary — a `Mutex<BinaryHeap>` plus `Notify` gives
/// the same multi-producer/single-consumer shape with explicit locking.
pub struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    notify: Notify,
    seq: AtomicU64,
}

struct Entry<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest ready_at sorts
        // to the top.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: T, delay: Duration) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = Entry {
            ready_at: Instant::now() + delay,
            seq,
            item,
        };
        self.heap.lock().expect("delay queue heap mutex poisoned").push(entry);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("delay queue heap mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the earliest-scheduled item is ready and returns it.
    /// Cancellation-safe: callers typically race this against a
    /// `CancellationToken` in a `tokio::select!`.
    pub async fn pop(&self) -> T {
        loop {
            let wait_until = {
                let mut heap = self.heap.lock().expect("delay queue heap mutex poisoned");
                match heap.peek() {
                    None => None,
                    Some(entry) => {
                        let now = Instant::now();
                        if entry.ready_at <= now {
                            return heap.pop().expect("peeked entry must be present").item;
                        }
                        Some(entry.ready_at - now)
                    }
                }
            };

            match wait_until {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => {
                    self.notify.notified().await;
                }
            }
        }
    }
}
