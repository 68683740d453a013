//! Message queues buffering encoded write-requests between ingress and the
//! worker pool.

use async_trait::async_trait;
use bytes::Bytes;
use diskqueue::DiskQueue;
use snafu::Snafu;

mod memory;

pub use memory::MemoryQueue;

#[derive(Debug, Snafu)]
pub enum QueueError {
    /// The bounded in-memory queue is at capacity; the message is discarded
    /// rather than blocking the producer.
    #[snafu(display("queue is full, discard message"))]
    Full,

    /// The queue has been closed.
    #[snafu(display("queue is exiting"))]
    Exiting,

    #[snafu(display("queue error: {message}"))]
    Internal { message: String },
}

/// A FIFO of opaque messages. Implementations are shared across the HTTP
/// handlers (producers) and the worker pool (consumers).
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues one message.
    async fn push(&self, data: Bytes) -> Result<(), QueueError>;

    /// Dequeues the next message, waiting until one is available.
    async fn pop(&self) -> Result<Bytes, QueueError>;

    /// Best-effort count of enqueued messages.
    fn depth(&self) -> i64;
}

#[async_trait]
impl Queue for diskqueue::DiskQueue {
    async fn push(&self, data: Bytes) -> Result<(), QueueError> {
        DiskQueue::push(self, data).await.map_err(|error| match error {
            diskqueue::PushError::Exiting => QueueError::Exiting,
            other => QueueError::Internal {
                message: other.to_string(),
            },
        })
    }

    async fn pop(&self) -> Result<Bytes, QueueError> {
        DiskQueue::pop(self).await.map_err(|_| QueueError::Exiting)
    }

    fn depth(&self) -> i64 {
        DiskQueue::depth(self)
    }
}
