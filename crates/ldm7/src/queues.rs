//! Shutdown-capable FIFO queues of product indices.
//!
//! Two of these track the backstop pipeline: "missed but not requested"
//! (fed by the multicast loss detector, drained by the requester) and
//! "requested but not delivered" (fed by the requester, drained by the
//! unicast receiver). Many producers, one consumer, strict FIFO.

use crate::error::{Ldm7Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

struct Inner {
    deque: VecDeque<u32>,
    shut: bool,
}

/// FIFO of product indices with a blocking head-peek and shutdown.
pub struct IndexQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl IndexQueue {
    pub fn new() -> IndexQueue {
        IndexQueue {
            inner: Mutex::new(Inner {
                deque: VecDeque::new(),
                shut: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends an index. Never blocks; returns `false` after shutdown.
    pub fn push(&self, index: u32) -> bool {
        let mut inner = self.lock();
        if inner.shut {
            return false;
        }
        inner.deque.push_back(index);
        drop(inner);
        // notify_one stores a permit, so a consumer arriving later still
        // wakes: no lost-wakeup window.
        self.notify.notify_one();
        true
    }

    /// Returns the head without removing it, blocking until one exists.
    /// Fails with [`Ldm7Error::Shutdown`] once the queue is shut down and
    /// drained.
    pub async fn peek_wait(&self) -> Result<u32> {
        loop {
            {
                let inner = self.lock();
                if let Some(&head) = inner.deque.front() {
                    return Ok(head);
                }
                if inner.shut {
                    return Err(Ldm7Error::Shutdown);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking head peek.
    pub fn peek(&self) -> Option<u32> {
        self.lock().deque.front().copied()
    }

    /// Removes the head if it equals `index`. Returns `false` otherwise.
    pub fn remove(&self, index: u32) -> bool {
        let mut inner = self.lock();
        if inner.deque.front() == Some(&index) {
            inner.deque.pop_front();
            true
        } else {
            false
        }
    }

    /// Unblocks all waiters with [`Ldm7Error::Shutdown`] and refuses new
    /// pushes. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shut = true;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shut
    }

    pub fn len(&self) -> usize {
        self.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().deque.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for IndexQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = IndexQueue::new();
        for i in [3u32, 1, 4, 1, 5] {
            assert!(q.push(i));
        }
        let mut out = Vec::new();
        while let Some(head) = q.peek() {
            out.push(head);
            assert!(q.remove(head));
        }
        assert_eq!(out, vec![3, 1, 4, 1, 5]);
    }

    #[tokio::test]
    async fn peek_wait_blocks_until_push() {
        let q = Arc::new(IndexQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.peek_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.push(42));
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
        // Peek does not consume.
        assert_eq!(q.peek(), Some(42));
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let q = Arc::new(IndexQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.peek_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();
        assert!(waiter.await.unwrap().unwrap_err().is_shutdown());
        assert!(!q.push(1));
    }

    #[tokio::test]
    async fn remove_only_matches_head() {
        let q = IndexQueue::new();
        q.push(10);
        q.push(11);
        assert!(!q.remove(11));
        assert!(q.remove(10));
        assert!(q.remove(11));
        assert!(q.is_empty());
    }
}
