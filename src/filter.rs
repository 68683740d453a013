//! Series filters applied by the consumer before partitioning.
//!
//! The cardinality filter bounds the number of distinct series accepted per
//! rolling window with an approximate set (bloom filter) plus an exact
//! counter of admitted distinct series, protecting downstream storage from a
//! label-explosion incident at the cost of false positives around one in a
//! million.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bloomy::BloomFilter;
use metrics::gauge;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Bloom false-positive probability the filter is sized for.
const PROB_COLLIDE: f64 = 1e-6;

#[derive(Debug, Snafu)]
pub enum FilterError {
    #[snafu(display("the maximum series count limit exceeded: {limit}"))]
    CapacityExceeded { limit: u64 },
}

/// A series filter; consumers skip any series a filter rejects.
pub trait SeriesFilter: Send + Sync {
    fn filter(&self, canonical: &str) -> Result<(), FilterError>;
}

/// Bloom bytes for an optimally-sized filter at [`PROB_COLLIDE`].
fn optimal_size_bytes(capacity: u64) -> usize {
    let bits = -(capacity as f64) * PROB_COLLIDE.ln() / std::f64::consts::LN_2.powi(2);
    (bits / 8.0).ceil() as usize
}

struct Inner {
    max_series: u64,
    accepted: AtomicU64,
    bloom: RwLock<BloomFilter<String>>,
}

/// Bounds distinct series per rolling window.
///
/// `max_series == 0` disables the filter entirely: `filter` becomes a no-op
/// and no reset task is spawned.
pub struct CardinalityFilter {
    inner: Option<Inner>,
}

impl CardinalityFilter {
    /// Creates the filter and, when enabled, starts its periodic reset task.
    /// The task stops when `shutdown` is cancelled.
    pub fn new(max_series: u64, flush_interval: Duration, shutdown: CancellationToken) -> Arc<Self> {
        if max_series == 0 {
            return Arc::new(Self { inner: None });
        }

        gauge!("filter_series_limit").set(max_series as f64);

        let filter = Arc::new(Self {
            inner: Some(Inner {
                max_series,
                accepted: AtomicU64::new(0),
                bloom: RwLock::new(BloomFilter::with_size(optimal_size_bytes(max_series))),
            }),
        });

        let reset = Arc::clone(&filter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => reset.reset(),
                }
            }
        });

        filter
    }

    /// Swaps in a fresh bloom filter and zeroes the accepted-series counter.
    fn reset(&self) {
        let Some(inner) = &self.inner else { return };
        let mut bloom = inner.bloom.write().expect("filter state poisoned");
        *bloom = BloomFilter::with_size(optimal_size_bytes(inner.max_series));
        inner.accepted.store(0, Ordering::Release);
        gauge!("filter_series_total").set(0.0);
        info!("cardinality filter reset");
    }
}

impl SeriesFilter for CardinalityFilter {
    fn filter(&self, canonical: &str) -> Result<(), FilterError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let key = canonical.to_owned();
        {
            let bloom = inner.bloom.read().expect("filter state poisoned");
            if bloom.contains(&key) {
                return Ok(());
            }
        }

        if inner.accepted.load(Ordering::Acquire) >= inner.max_series {
            return Err(FilterError::CapacityExceeded {
                limit: inner.max_series,
            });
        }

        let mut bloom = inner.bloom.write().expect("filter state poisoned");
        // A reset or another writer may have slipped in between the locks.
        if !bloom.contains(&key) {
            bloom.insert(&key);
            inner.accepted.fetch_add(1, Ordering::AcqRel);
            gauge!("filter_series_total").increment(1.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(i: usize) -> String {
        format!(r#"{{__name__="metric_{i}", job="node"}}"#)
    }

    #[tokio::test]
    async fn admits_up_to_the_cap_and_rejects_beyond() {
        let filter = CardinalityFilter::new(2, Duration::from_secs(3600), CancellationToken::new());

        assert!(filter.filter(&series(1)).is_ok());
        assert!(filter.filter(&series(2)).is_ok());
        assert!(matches!(
            filter.filter(&series(3)),
            Err(FilterError::CapacityExceeded { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn repeats_of_admitted_series_pass() {
        let filter = CardinalityFilter::new(1, Duration::from_secs(3600), CancellationToken::new());

        assert!(filter.filter(&series(1)).is_ok());
        assert!(filter.filter(&series(1)).is_ok());
        assert!(filter.filter(&series(2)).is_err());
        assert!(filter.filter(&series(1)).is_ok());
    }

    #[tokio::test]
    async fn periodic_reset_reopens_capacity() {
        let filter =
            CardinalityFilter::new(1, Duration::from_millis(50), CancellationToken::new());

        assert!(filter.filter(&series(1)).is_ok());
        assert!(filter.filter(&series(2)).is_err());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(filter.filter(&series(2)).is_ok());
    }

    #[tokio::test]
    async fn zero_cap_disables_filtering() {
        let filter = CardinalityFilter::new(0, Duration::from_secs(1), CancellationToken::new());
        for i in 0..1000 {
            assert!(filter.filter(&series(i)).is_ok());
        }
    }
}
