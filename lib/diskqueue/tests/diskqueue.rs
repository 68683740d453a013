use std::time::Duration;

use bytes::Bytes;
use diskqueue::{DiskQueue, DiskQueueConfig};
use tempfile::TempDir;

fn config(dir: &TempDir) -> DiskQueueConfig {
    DiskQueueConfig::new("test", dir.path(), 1024 * 1024)
}

fn segment_path(dir: &TempDir, num: u64) -> std::path::PathBuf {
    dir.path().join(format!("test.diskqueue.{:06}.dat", num))
}

fn meta_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("test.diskqueue.meta.dat")
}

// Depth is published by the serializer after the pop reply is delivered, so
// assertions that follow a pop may need to wait a beat.
async fn wait_for_depth(queue: &DiskQueue, expected: i64) {
    for _ in 0..200 {
        if queue.depth() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(queue.depth(), expected);
}

#[tokio::test]
async fn push_pop_preserves_fifo_order() {
    let dir = TempDir::new().unwrap();
    let queue = DiskQueue::open(config(&dir)).await;

    for i in 0..100u32 {
        queue
            .push(Bytes::from(format!("message-{i}")))
            .await
            .unwrap();
    }
    assert_eq!(queue.depth(), 100);

    for i in 0..100u32 {
        let frame = queue.pop().await.unwrap();
        assert_eq!(frame, Bytes::from(format!("message-{i}")));
    }
    wait_for_depth(&queue, 0).await;
}

#[tokio::test]
async fn messages_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let queue = DiskQueue::open(config(&dir)).await;
    queue.push(Bytes::from_static(b"durable")).await.unwrap();
    queue.close().await.unwrap();

    let queue = DiskQueue::open(config(&dir)).await;
    assert_eq!(queue.depth(), 1);
    assert_eq!(queue.pop().await.unwrap(), Bytes::from_static(b"durable"));
}

#[tokio::test]
async fn writes_roll_segments_and_reads_unlink_them() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.max_bytes_per_file = 4096;
    let queue = DiskQueue::open(config).await;

    // 10 KiB of payload across 10 messages rolls through three segments.
    let payload = Bytes::from(vec![b'x'; 1024]);
    for _ in 0..10 {
        queue.push(payload.clone()).await.unwrap();
    }

    let mut segments: Vec<_> = (0..4).filter(|n| segment_path(&dir, *n).exists()).collect();
    segments.sort_unstable();
    assert_eq!(segments, vec![0, 1, 2]);

    for _ in 0..10 {
        assert_eq!(queue.pop().await.unwrap(), payload);
    }
    wait_for_depth(&queue, 0).await;

    // Fully-consumed segments are unlinked; only the current write segment
    // remains.
    assert!(!segment_path(&dir, 0).exists());
    assert!(!segment_path(&dir, 1).exists());
    assert!(segment_path(&dir, 2).exists());
}

#[tokio::test]
async fn corrupt_segment_is_quarantined_and_skipped() {
    let dir = TempDir::new().unwrap();

    let queue = DiskQueue::open(config(&dir)).await;
    queue.push(Bytes::from_static(b"poisoned")).await.unwrap();
    queue.close().await.unwrap();

    // Zero the length prefix: an impossible frame size is corruption.
    let segment = segment_path(&dir, 0);
    let mut contents = std::fs::read(&segment).unwrap();
    contents[..4].copy_from_slice(&[0, 0, 0, 0]);
    std::fs::write(&segment, contents).unwrap();

    let queue = DiskQueue::open(config(&dir)).await;

    // A fresh message lands on the next segment and is readable; the bad
    // segment is renamed aside, and the stale depth is reconciled to zero at
    // the tail.
    queue.push(Bytes::from_static(b"fresh")).await.unwrap();
    assert_eq!(queue.pop().await.unwrap(), Bytes::from_static(b"fresh"));

    let mut bad = segment.into_os_string();
    bad.push(".bad");
    assert!(std::path::PathBuf::from(bad).exists());
    wait_for_depth(&queue, 0).await;
}

#[tokio::test]
async fn empty_discards_pending_data() {
    let dir = TempDir::new().unwrap();
    let queue = DiskQueue::open(config(&dir)).await;

    for _ in 0..10 {
        queue.push(Bytes::from_static(b"discard me")).await.unwrap();
    }
    assert_eq!(queue.depth(), 10);

    queue.empty().await.unwrap();
    assert_eq!(queue.depth(), 0);
    assert!(!segment_path(&dir, 0).exists());
    assert!(!meta_path(&dir).exists());

    // The queue keeps working on a fresh segment afterwards.
    queue.push(Bytes::from_static(b"kept")).await.unwrap();
    assert_eq!(queue.pop().await.unwrap(), Bytes::from_static(b"kept"));
}

#[tokio::test]
async fn close_fails_later_operations() {
    let dir = TempDir::new().unwrap();
    let queue = DiskQueue::open(config(&dir)).await;

    queue.push(Bytes::from_static(b"one")).await.unwrap();
    queue.close().await.unwrap();

    assert!(queue.push(Bytes::from_static(b"two")).await.is_err());
    assert!(queue.pop().await.is_err());

    // Depth keeps reporting the last value published by the serializer.
    assert_eq!(queue.depth(), 1);
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.max_msg_size = 8;
    let queue = DiskQueue::open(config).await;

    assert!(queue
        .push(Bytes::from_static(b"way past the limit"))
        .await
        .is_err());
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn pop_blocks_until_data_arrives() {
    let dir = TempDir::new().unwrap();
    let queue = DiskQueue::open(config(&dir)).await;

    let reader = queue.clone();
    let waiter = tokio::spawn(async move { reader.pop().await.unwrap() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    queue.push(Bytes::from_static(b"late arrival")).await.unwrap();
    let frame = waiter.await.unwrap();
    assert_eq!(frame, Bytes::from_static(b"late arrival"));
}
