//! A single downstream sender.
//!
//! Each endpoint owns one backend address and a long-lived task that
//! accumulates incoming series into batches, flushing when a batch fills or
//! on a periodic ticker. Flushes run through a semaphore so at most
//! `concurrency` requests are in flight per endpoint; a transport failure
//! rolls the whole batch back into the staging channel for a later attempt,
//! while a non-2xx response drops the batch so a permanently rejected
//! payload cannot pin the pipeline.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use prost::Message;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::proto::remote::{Label, Sample, TimeSeries, WriteRequest};

/// Time-series batched per send.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Ticker interval for flushing an under-filled batch.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Per-request deadline on the remote-write POST.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

const ROLLBACK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub flush_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: 1,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Handle to a running endpoint task.
pub struct Endpoint {
    addr: String,
    staging_tx: mpsc::Sender<TimeSeries>,
    done: CancellationToken,
}

impl Endpoint {
    /// Spawns the batching task for `addr`.
    pub fn start(addr: String, config: EndpointConfig, client: reqwest::Client) -> Arc<Self> {
        info!(addr = %addr, "starting endpoint");
        let (staging_tx, staging_rx) = mpsc::channel(config.batch_size.max(1) * 2);
        let done = CancellationToken::new();

        let endpoint = Arc::new(Self {
            addr: addr.clone(),
            staging_tx: staging_tx.clone(),
            done: done.clone(),
        });

        tokio::spawn(run(addr, config, client, staging_rx, staging_tx, done));
        endpoint
    }

    /// Stages one series for batching.
    ///
    /// Waits for room in the staging channel (bounded at twice the batch
    /// size); returns immediately without staging once the endpoint has been
    /// stopped.
    pub async fn send(&self, labels: Vec<Label>, samples: Vec<Sample>) {
        let series = TimeSeries { labels, samples };
        tokio::select! {
            _ = self.done.cancelled() => {
                info!(addr = %self.addr, "endpoint closed, dropping send");
            }
            _ = self.staging_tx.send(series) => {}
        }
    }

    /// Stops the batching task. Staged but unflushed series are dropped.
    pub fn stop(&self) {
        info!(addr = %self.addr, "stopping endpoint");
        self.done.cancel();
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

async fn run(
    addr: String,
    config: EndpointConfig,
    client: reqwest::Client,
    mut staging_rx: mpsc::Receiver<TimeSeries>,
    staging_tx: mpsc::Sender<TimeSeries>,
    done: CancellationToken,
) {
    let gate = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut batch: Vec<TimeSeries> = Vec::new();

    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            Some(series) = staging_rx.recv() => {
                batch.push(series);
                if batch.len() < config.batch_size {
                    continue;
                }
                dispatch(&gate, &client, &addr, &staging_tx, std::mem::take(&mut batch)).await;
            }
            _ = ticker.tick() => {
                if batch.is_empty() {
                    continue;
                }
                debug!(addr = %addr, size = batch.len(), "flushing staged series on ticker");
                dispatch(&gate, &client, &addr, &staging_tx, std::mem::take(&mut batch)).await;
            }
        }
    }
}

/// Takes a concurrency slot (waiting when all are in flight) and hands the
/// batch to a flusher task that releases the slot when done.
async fn dispatch(
    gate: &Arc<Semaphore>,
    client: &reqwest::Client,
    addr: &str,
    staging_tx: &mpsc::Sender<TimeSeries>,
    batch: Vec<TimeSeries>,
) {
    let permit = Arc::clone(gate)
        .acquire_owned()
        .await
        .expect("concurrency gate never closed");

    let client = client.clone();
    let addr = addr.to_owned();
    let staging_tx = staging_tx.clone();
    tokio::spawn(async move {
        flush(&client, &addr, &staging_tx, batch).await;
        drop(permit);
    });
}

async fn flush(
    client: &reqwest::Client,
    addr: &str,
    staging_tx: &mpsc::Sender<TimeSeries>,
    batch: Vec<TimeSeries>,
) {
    debug!(endpoint = %addr, size = batch.len(), "sending batch");

    let request = WriteRequest { timeseries: batch };
    let encoded = request.encode_to_vec();
    let compressed = match snap::raw::Encoder::new().compress_vec(&encoded) {
        Ok(compressed) => compressed,
        Err(error) => {
            counter!("endpoint_send_failed_total", "endpoint" => addr.to_owned(), "reason" => "compress")
                .increment(1);
            error!(endpoint = %addr, %error, "failed to compress batch");
            return;
        }
    };

    let started = Instant::now();
    let response = client
        .post(format!("http://{addr}/api/v1/write"))
        .header(http::header::CONTENT_TYPE, "application/x-protobuf")
        .header(http::header::CONTENT_ENCODING, "snappy")
        .header("X-Prometheus-Remote-Write-Version", "0.1.0")
        .body(compressed)
        .send()
        .await;

    match response {
        Err(error) => {
            counter!("endpoint_send_failed_total", "endpoint" => addr.to_owned(), "reason" => "transport")
                .increment(1);
            error!(endpoint = %addr, %error, "batch send failed, rolling back");
            tokio::time::sleep(ROLLBACK_DELAY).await;
            rollback(staging_tx, request.timeseries).await;
        }
        Ok(response) if !response.status().is_success() => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            counter!("endpoint_send_failed_total", "endpoint" => addr.to_owned(), "reason" => "status")
                .increment(1);
            // A permanent server-side rejection; retrying would pin the
            // pipeline, so the batch is dropped.
            error!(endpoint = %addr, %status, body = %body, "backend rejected batch");
        }
        Ok(_) => {
            counter!("endpoint_send_success_total", "endpoint" => addr.to_owned()).increment(1);
            histogram!("endpoint_send_duration_seconds", "endpoint" => addr.to_owned())
                .record(started.elapsed().as_secs_f64());
        }
    }
}

/// Re-stages every series of a failed batch, preserving order.
async fn rollback(staging_tx: &mpsc::Sender<TimeSeries>, batch: Vec<TimeSeries>) {
    for series in batch {
        if staging_tx.send(series).await.is_err() {
            // Endpoint stopped while rolling back; nothing left to do.
            return;
        }
    }
}
