//! Message consumers: turn one queue message into per-endpoint sends.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use prost::Message;
use snafu::{ensure, Snafu};
use tracing::{debug, info, warn};

use crate::backend::{EndpointPool, PoolError};
use crate::filter::SeriesFilter;
use crate::labels;
use crate::proto::remote::WriteRequest;

/// Copies of each series delivered downstream.
pub const DEFAULT_REPLICATION_FACTOR: usize = 1;

/// Samples stamped further than this into the future are rejected.
const MAX_FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Snafu)]
pub enum ConsumeError {
    #[snafu(display("snappy decode failed: {source}"))]
    Decompress { source: snap::Error },

    #[snafu(display("protobuf decode failed: {source}"))]
    Decode { source: prost::DecodeError },

    #[snafu(display("empty timeseries"))]
    EmptyTimeseries,

    // The message text carries the marker the worker's poison table matches
    // on.
    #[snafu(display("found out of order sample"))]
    OutOfOrderSample,

    #[snafu(display("get endpoints from backend failed: {source}"))]
    Endpoints { source: PoolError },
}

impl ConsumeError {
    /// Whether the worker should re-queue the original message.
    pub fn needs_retry(&self) -> bool {
        // Everything else is either malformed input or data that will fail
        // again identically; only a routing gap (mid-refresh, empty DNS
        // answer) can heal.
        matches!(self, Self::Endpoints { .. })
    }
}

/// The message-processing capability the worker pool drives.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle_message(&self, message: &[u8]) -> Result<(), ConsumeError>;
}

/// Decodes a write-request message, validates and filters each series, and
/// partitions it across the endpoint pool.
pub struct RemoteWriteConsumer {
    pool: Arc<EndpointPool>,
    filters: Vec<Arc<dyn SeriesFilter>>,
    replication: usize,
}

impl RemoteWriteConsumer {
    pub fn new(pool: Arc<EndpointPool>, filters: Vec<Arc<dyn SeriesFilter>>) -> Self {
        Self {
            pool,
            filters,
            replication: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

#[async_trait]
impl Consumer for RemoteWriteConsumer {
    async fn handle_message(&self, message: &[u8]) -> Result<(), ConsumeError> {
        let decompressed = match snap::raw::Decoder::new().decompress_vec(message) {
            Ok(decompressed) => decompressed,
            Err(source) => {
                counter!("consumer_message_failed_total", "reason" => "snappy_decode").increment(1);
                return Err(ConsumeError::Decompress { source });
            }
        };

        let request = match WriteRequest::decode(&decompressed[..]) {
            Ok(request) => request,
            Err(source) => {
                counter!("consumer_message_failed_total", "reason" => "proto_decode").increment(1);
                return Err(ConsumeError::Decode { source });
            }
        };

        ensure!(!request.timeseries.is_empty(), EmptyTimeseriesSnafu);

        let now = chrono::Utc::now().timestamp();
        'series: for series in &request.timeseries {
            let label_map = labels::label_map(&series.labels);
            let canonical = labels::canonical_string(&label_map);

            // Clock-skew guard: a timestamp more than a minute ahead of this
            // proxy can never be in order for the backend.
            for sample in &series.samples {
                if sample.timestamp / 1000 - now > MAX_FUTURE_SKEW_SECS {
                    warn!(
                        ts = sample.timestamp,
                        labels = %canonical,
                        "sample timestamp too far in the future"
                    );
                    return OutOfOrderSampleSnafu.fail();
                }
            }

            for filter in &self.filters {
                if let Err(error) = filter.filter(&canonical) {
                    info!(%error, labels = %canonical, "series filtered");
                    continue 'series;
                }
            }

            let endpoints = match self.pool.endpoints_for(&canonical, self.replication) {
                Ok(endpoints) => endpoints,
                Err(source) => {
                    counter!("consumer_message_failed_total", "reason" => "get_endpoints")
                        .increment(1);
                    return Err(ConsumeError::Endpoints { source });
                }
            };

            for endpoint in endpoints {
                debug!(labels = %canonical, endpoint = %endpoint.addr(), "dispatching series");
                endpoint
                    .send(series.labels.clone(), series.samples.clone())
                    .await;
                counter!("consumer_message_success_total", "endpoint" => endpoint.addr().to_owned())
                    .increment(1);
            }
        }

        Ok(())
    }
}
