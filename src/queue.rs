//! Bounded in-memory queue with drop-oldest back-pressure (spec §4.2,
//! §9 design note: "bounded queue per stream, drop oldest on overflow and
//! increment a counter"). Order-book deltas don't use this: a dropped
//! delta would silently corrupt the book, so that path is exempted and
//! instead forces a resync (see `orderbook::reconstructor`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

/// A multi-producer, single-consumer bounded queue that drops the oldest
/// item instead of blocking the producer when full.
pub struct DropOldestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Pushes an item, dropping the oldest queued item if at capacity.
    /// Returns `true` if a drop occurred.
    pub async fn push(&self, item: T) -> bool {
        let mut items = self.inner.items.lock().await;
        let dropped = if items.len() >= self.inner.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        drop(items);
        if dropped {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        dropped
    }

    /// Waits for and removes the oldest item.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut items = self.inner.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return item;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drains everything currently queued without waiting, for batch
    /// writer flush cycles that want "whatever has accumulated so far".
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.inner.items.lock().await;
        items.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(4);
        q.push(1).await;
        q.push(2).await;
        assert_eq!(q.pop().await, 1);
        assert_eq!(q.pop().await, 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(2);
        assert!(!q.push(1).await);
        assert!(!q.push(2).await);
        assert!(q.push(3).await);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop().await, 2);
        assert_eq!(q.pop().await, 3);
    }

    #[tokio::test]
    async fn drain_empties_without_blocking() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(4);
        q.push(1).await;
        q.push(2).await;
        let drained = q.drain().await;
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(q.len().await, 0);
    }
}
