//! A filesystem-backed FIFO queue of opaque byte messages.
//!
//! Messages are framed as `[u32 length, big-endian][payload]` and appended to
//! a sequence of bounded-size segment files. A single serializer task owns
//! every file handle and all mutable position state; pushes, pops, empties,
//! and shutdown arrive over channels and results travel back the same way,
//! which keeps the hot path free of locks.
//!
//! Read and write positions (and the queue depth) are persisted to a small
//! text metadata file via write-to-temp-then-rename, so a crash loses at most
//! the frames written since the last fsync.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot, watch};

mod serializer;

use serializer::Serializer;

/// Default segment size before rolling to a new file: 100 MiB.
pub const DEFAULT_MAX_BYTES_PER_FILE: u64 = 104_857_600;
/// Default number of writes between forced fsyncs.
pub const DEFAULT_SYNC_EVERY: u64 = 2500;
/// Default idle deadline after which dirty state is fsynced.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Error returned by [`DiskQueue::push`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum PushError {
    /// The serializer has shut down and can no longer accept writes.
    #[snafu(display("queue is exiting"))]
    Exiting,

    /// The message falls outside the configured size bounds.
    #[snafu(display(
        "invalid message write size ({size}), limits [{min}, {max}]"
    ))]
    InvalidMessageSize { size: usize, min: u32, max: u32 },

    /// The synchronous write behind the push failed.
    #[snafu(display("queue write failed: {source}"))]
    Io { source: std::io::Error },
}

/// Error returned by [`DiskQueue::pop`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum PopError {
    /// The serializer has shut down; no further frames will be produced.
    #[snafu(display("queue is exiting"))]
    Exiting,
}

/// Error returned by the control operations ([`DiskQueue::empty`],
/// [`DiskQueue::close`]).
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ControlError {
    #[snafu(display("queue is exiting"))]
    Exiting,

    #[snafu(display("queue file operation failed: {source}"))]
    Io { source: std::io::Error },
}

/// Instantiation-time settings for a [`DiskQueue`].
#[derive(Debug, Clone)]
pub struct DiskQueueConfig {
    /// Queue name; used in file names and metric labels.
    pub name: String,
    /// Directory holding segment and metadata files.
    pub data_path: PathBuf,
    /// Byte offset past which a write rolls to a new segment file.
    pub max_bytes_per_file: u64,
    /// Smallest frame accepted; anything under it on read is corruption.
    pub min_msg_size: u32,
    /// Largest frame accepted; anything over it on read is corruption.
    pub max_msg_size: u32,
    /// Number of writes between forced fsyncs.
    pub sync_every: u64,
    /// Idle deadline after which dirty state is fsynced.
    pub sync_timeout: Duration,
}

impl DiskQueueConfig {
    pub fn new(name: impl Into<String>, data_path: impl Into<PathBuf>, max_msg_size: u32) -> Self {
        Self {
            name: name.into(),
            data_path: data_path.into(),
            max_bytes_per_file: DEFAULT_MAX_BYTES_PER_FILE,
            min_msg_size: 1,
            max_msg_size,
            sync_every: DEFAULT_SYNC_EVERY,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

pub(crate) type WriteRequest = (Bytes, oneshot::Sender<Result<(), PushError>>);
pub(crate) type PopRequest = oneshot::Sender<Bytes>;
pub(crate) type ControlRequest = oneshot::Sender<Result<(), ControlError>>;

/// Handle to a disk-backed FIFO queue.
///
/// Cloning the handle is cheap; all clones talk to the same serializer task.
#[derive(Clone)]
pub struct DiskQueue {
    name: String,
    write_tx: mpsc::Sender<WriteRequest>,
    pop_tx: mpsc::Sender<PopRequest>,
    empty_tx: mpsc::Sender<ControlRequest>,
    close_tx: mpsc::Sender<ControlRequest>,
    depth_rx: watch::Receiver<i64>,
}

impl DiskQueue {
    /// Opens (or creates) the queue at `config.data_path`, recovering any
    /// persisted metadata, and starts the serializer task.
    ///
    /// An unreadable metadata file is logged and treated as an empty queue,
    /// matching the recovery stance for a half-written metadata rename.
    pub async fn open(config: DiskQueueConfig) -> Self {
        let name = config.name.clone();
        let (write_tx, write_rx) = mpsc::channel(1);
        let (pop_tx, pop_rx) = mpsc::channel(1);
        let (empty_tx, empty_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (depth_tx, depth_rx) = watch::channel(0);

        let serializer =
            Serializer::recover(config, write_rx, pop_rx, empty_rx, close_rx, depth_tx).await;
        tokio::spawn(serializer.io_loop());

        Self {
            name,
            write_tx,
            pop_tx,
            empty_tx,
            close_tx,
            depth_rx,
        }
    }

    /// Appends one message to the queue.
    ///
    /// Completes once the serializer has performed the write, surfacing any
    /// filesystem error it hit. Fails with [`PushError::Exiting`] after
    /// [`close`](Self::close).
    pub async fn push(&self, data: Bytes) -> Result<(), PushError> {
        counter!("diskqueue_message_push_total", "name" => self.name.clone()).increment(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send((data, reply_tx))
            .await
            .map_err(|_| PushError::Exiting)?;
        reply_rx.await.map_err(|_| PushError::Exiting)?
    }

    /// Removes and returns the frame at the head of the queue, waiting until
    /// one is available. Never returns a partial frame.
    pub async fn pop(&self) -> Result<Bytes, PopError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pop_tx
            .send(reply_tx)
            .await
            .map_err(|_| PopError::Exiting)?;
        let data = reply_rx.await.map_err(|_| PopError::Exiting)?;
        counter!("diskqueue_message_pop_total", "name" => self.name.clone()).increment(1);
        Ok(data)
    }

    /// Snapshot of the number of messages written but not yet popped.
    ///
    /// Reads the most recent value published by the serializer; after the
    /// serializer exits this keeps returning the last-known value.
    pub fn depth(&self) -> i64 {
        *self.depth_rx.borrow()
    }

    /// Destructively discards all pending data by fast-forwarding to a fresh
    /// segment and deleting every previous segment and the metadata file.
    pub async fn empty(&self) -> Result<(), ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.empty_tx
            .send(reply_tx)
            .await
            .map_err(|_| ControlError::Exiting)?;
        reply_rx.await.map_err(|_| ControlError::Exiting)?
    }

    /// Stops the serializer, fsyncing the write file and persisting metadata.
    ///
    /// Pushes that were queued but not yet written fail with
    /// [`PushError::Exiting`]; subsequent operations fail the same way.
    pub async fn close(&self) -> Result<(), ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.close_tx
            .send(reply_tx)
            .await
            .map_err(|_| ControlError::Exiting)?;
        reply_rx.await.map_err(|_| ControlError::Exiting)?
    }
}
