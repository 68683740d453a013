//! The worker pool binding the queue to the consumer.
//!
//! Each worker pops one message at a time, hands it to the consumer, and
//! applies the retry policy: poison data is dropped, retryable failures are
//! pushed back onto the queue, and everything else is dropped. Workers
//! observe cancellation at the top of every iteration.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::Consumer;
use crate::queue::Queue;

/// Error fragments produced downstream for data that can never be ingested;
/// re-queuing such a message would loop it forever.
const POISON_MARKERS: [&str; 3] = [
    "out of bounds",
    "out of order sample",
    "duplicate sample for timestamp",
];

/// Spawns `num` workers sharing one queue and consumer.
pub fn spawn_workers(
    num: usize,
    queue: Arc<dyn Queue>,
    consumer: Arc<dyn Consumer>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (1..=num)
        .map(|id| {
            tokio::spawn(worker_loop(
                id,
                Arc::clone(&queue),
                Arc::clone(&consumer),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn worker_loop(
    id: usize,
    queue: Arc<dyn Queue>,
    consumer: Arc<dyn Consumer>,
    shutdown: CancellationToken,
) {
    info!(id, "worker started");
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(id, "worker stopped");
                return;
            }
            popped = queue.pop() => match popped {
                Ok(message) => message,
                Err(error) => {
                    // The queue only fails a pop when it is shutting down.
                    info!(id, %error, "worker stopped, queue closed");
                    return;
                }
            }
        };

        if let Err(error) = consumer.handle_message(&message).await {
            let text = error.to_string();
            if POISON_MARKERS.iter().any(|marker| text.contains(marker)) {
                error!(id, %error, "dropping poison message");
                continue;
            }

            error!(id, %error, "handle message failed");
            if error.needs_retry() {
                if let Err(error) = queue.push(message).await {
                    error!(id, %error, "message requeue failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::consumer::ConsumeError;
    use crate::queue::MemoryQueue;

    /// Fails every message the same way, counting deliveries.
    struct FailingConsumer {
        error: fn() -> ConsumeError,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Consumer for FailingConsumer {
        async fn handle_message(&self, _message: &[u8]) -> Result<(), ConsumeError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    async fn run_one_message(error: fn() -> ConsumeError) -> (Arc<MemoryQueue>, Arc<FailingConsumer>) {
        let queue = Arc::new(MemoryQueue::with_capacity(16));
        let consumer = Arc::new(FailingConsumer {
            error,
            handled: AtomicUsize::new(0),
        });

        queue.push(Bytes::from_static(b"message")).await.unwrap();

        let shutdown = CancellationToken::new();
        let workers = spawn_workers(1, queue.clone(), consumer.clone(), shutdown.clone());

        // Give the worker a beat to consume (and possibly requeue once).
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        (queue, consumer)
    }

    #[tokio::test]
    async fn poison_errors_are_dropped_not_requeued() {
        let (queue, consumer) = run_one_message(|| ConsumeError::OutOfOrderSample).await;
        assert!(consumer.handled.load(Ordering::SeqCst) >= 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_are_dropped() {
        let (queue, consumer) = run_one_message(|| ConsumeError::EmptyTimeseries).await;
        assert!(consumer.handled.load(Ordering::SeqCst) >= 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn retryable_errors_requeue_the_message() {
        let queue = Arc::new(MemoryQueue::with_capacity(16));
        let consumer = Arc::new(FailingConsumer {
            error: || ConsumeError::Endpoints {
                source: crate::backend::PoolError::UnknownEndpoint {
                    addr: "10.0.0.1:9090".into(),
                },
            },
            handled: AtomicUsize::new(0),
        });

        queue.push(Bytes::from_static(b"message")).await.unwrap();

        let shutdown = CancellationToken::new();
        let workers = spawn_workers(1, queue.clone(), consumer.clone(), shutdown.clone());

        // The message keeps cycling through pop -> fail -> requeue, so the
        // consumer sees it more than once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        assert!(consumer.handled.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_idle_workers() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = Arc::new(FailingConsumer {
            error: || ConsumeError::EmptyTimeseries,
            handled: AtomicUsize::new(0),
        });

        let shutdown = CancellationToken::new();
        let workers = spawn_workers(4, queue, consumer, shutdown.clone());
        shutdown.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
