// =============================================================================
// Drop-oldest bounded channel — backpressure without blocking producers
// =============================================================================
//
// `tokio::sync::mpsc` has no drop-oldest mode: a full bounded channel blocks
// the sender, and an unbounded one never sheds load. Market-data producers
// must never block on a slow consumer, so this channel instead evicts the
// oldest queued item and counts the eviction. Built on the same
// `parking_lot` guard + explicit capacity trim idiom the candle ring buffer
// uses, with an `AtomicU64` counter for lock-free overflow observability.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
    senders: AtomicU64,
}

/// Producer handle. Cloneable; the channel closes once every sender is
/// dropped and the receiver has drained the backlog.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// Single consumer handle.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded drop-oldest channel with room for `capacity` items.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be non-zero");
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: std::sync::atomic::AtomicBool::new(false),
        senders: AtomicU64::new(1),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

impl<T> Sender<T> {
    /// Push an item. If the channel is at capacity, the oldest queued item
    /// is dropped to make room and the overflow counter is incremented.
    /// Never blocks.
    pub fn send(&self, item: T) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        drop(queue);
        self.shared.notify.notify_one();
    }

    /// Total items dropped for capacity since channel creation.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Items currently queued, awaiting the consumer.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Sender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.closed.store(true, Ordering::Release);
            self.shared.notify.notify_one();
        }
    }
}

impl<T> Receiver<T> {
    /// Wait for the next item. Returns `None` once every sender has
    /// dropped and the backlog is empty.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.shared.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_under_capacity() {
        let (tx, mut rx) = channel::<u32>(4);
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let (tx, mut rx) = channel::<u32>(2);
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(tx.dropped_count(), 1);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn closes_when_all_senders_drop() {
        let (tx, mut rx) = channel::<u32>(4);
        tx.send(1);
        drop(tx);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn clone_keeps_channel_open() {
        let (tx, mut rx) = channel::<u32>(4);
        let tx2 = tx.clone();
        drop(tx);
        tx2.send(42);
        drop(tx2);
        assert_eq!(rx.recv().await, Some(42));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn queue_depth_reflects_pending_items() {
        let (tx, _rx) = channel::<u32>(4);
        tx.send(1);
        tx.send(2);
        assert_eq!(tx.queue_depth(), 2);
    }
}
