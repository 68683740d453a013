//! Bounded in-memory queue variant.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};

use super::{Queue, QueueError};

pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// A bounded channel queue. `push` never blocks the producer: when the
/// channel is at capacity the message is rejected with
/// [`QueueError::Full`].
pub struct MemoryQueue {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    depth: AtomicI64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicI64::new(0),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, data: Bytes) -> Result<(), QueueError> {
        match self.tx.try_send(data) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("queue_full_total").increment(1);
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Exiting),
        }
    }

    async fn pop(&self) -> Result<Bytes, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(data) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Ok(data)
            }
            None => Err(QueueError::Exiting),
        }
    }

    fn depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_roundtrip() {
        let queue = MemoryQueue::new();
        queue.push(Bytes::from_static(b"one")).await.unwrap();
        queue.push(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.pop().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(queue.pop().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let queue = MemoryQueue::with_capacity(2);
        queue.push(Bytes::from_static(b"a")).await.unwrap();
        queue.push(Bytes::from_static(b"b")).await.unwrap();

        assert!(matches!(
            queue.push(Bytes::from_static(b"c")).await,
            Err(QueueError::Full)
        ));

        // Draining one slot admits the next push.
        queue.pop().await.unwrap();
        queue.push(Bytes::from_static(b"c")).await.unwrap();
    }
}
