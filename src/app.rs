//! Process assembly: wires the queue, endpoint pool, filters, consumer,
//! worker pool, and HTTP ingress together, then runs until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use diskqueue::{DiskQueue, DiskQueueConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{EndpointConfig, EndpointPool, PoolConfig, PoolError};
use crate::config::{Config, QueueKind};
use crate::consumer::RemoteWriteConsumer;
use crate::filter::{CardinalityFilter, SeriesFilter};
use crate::http::{self, ApiContext, ServerError};
use crate::queue::{MemoryQueue, Queue};
use crate::worker;

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("failed to install metrics recorder: {source}"))]
    Metrics {
        source: metrics_exporter_prometheus::BuildError,
    },

    #[snafu(display("failed to start endpoint pool: {source}"))]
    Pool { source: PoolError },

    #[snafu(display("{source}"))]
    Server { source: ServerError },
}

/// Runs the proxy until a termination signal arrives.
pub async fn run(config: Config) -> Result<(), AppError> {
    let shutdown = CancellationToken::new();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context(MetricsSnafu)?;

    let pool = EndpointPool::start(
        PoolConfig {
            name: config.sd.name.clone(),
            refresh_interval: Duration::from_secs(config.sd.refresh_interval.max(1)),
            endpoint: EndpointConfig {
                concurrency: config.worker.num.max(1),
                ..EndpointConfig::default()
            },
        },
        shutdown.child_token(),
    )
    .context(PoolSnafu)?;

    // The disk handle is kept separately so shutdown can sync and close it.
    let (queue, disk): (Arc<dyn Queue>, Option<DiskQueue>) = match config.queue.kind {
        QueueKind::Memory => (Arc::new(MemoryQueue::new()), None),
        QueueKind::Disk => {
            let disk = DiskQueue::open(DiskQueueConfig::new(
                config.queue.name.clone(),
                config.queue.data_path.clone(),
                config.queue.msg_size_limit,
            ))
            .await;
            (Arc::new(disk.clone()), Some(disk))
        }
    };

    let filter = CardinalityFilter::new(
        config.api.max_series_count_limit,
        Duration::from_secs(config.api.series_count_flush_interval.max(1)),
        shutdown.child_token(),
    );

    let consumer = Arc::new(RemoteWriteConsumer::new(
        Arc::clone(&pool),
        vec![filter as Arc<dyn SeriesFilter>],
    ));
    let workers = worker::spawn_workers(
        config.worker.num,
        Arc::clone(&queue),
        consumer,
        shutdown.child_token(),
    );

    if config.api.pprof {
        debug!("pprof is enabled in the configuration but not available in this build");
    }

    let ctx = Arc::new(
        ApiContext::new(
            &config.api,
            config.auth.clone(),
            Arc::clone(&queue),
            Some(metrics_handle),
        )
        .context(ServerSnafu)?,
    );
    let serving = http::bind(&config.api.listen, ctx, shutdown.child_token())
        .context(ServerSnafu)?;
    let server = tokio::spawn(serving);

    wait_for_termination().await;
    info!("termination signal received, shutting down");

    // Stop accepting, then stop the pipeline, then settle the queue.
    shutdown.cancel();
    if let Err(error) = server.await {
        error!(%error, "http server task failed");
    }
    for handle in workers {
        if let Err(error) = handle.await {
            error!(%error, "worker task failed");
        }
    }
    if let Some(disk) = disk {
        if let Err(error) = disk.close().await {
            error!(%error, "disk queue close failed");
        }
    }

    Ok(())
}

async fn wait_for_termination() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(error) => {
            error!(%error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
