//! The pool of downstream storage backends.
//!
//! Addresses are discovered by DNS on a refresh interval. Each resolved
//! address gets a long-lived [`Endpoint`] sender; on every refresh the pool
//! diffs the answer against the running set, starting endpoints for new
//! addresses and stopping removed ones, and hands the full address list to
//! the sharding structure. A failed resolution leaves everything untouched.

pub mod endpoint;
pub mod sharding;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::{counter, gauge};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dns;

pub use endpoint::{Endpoint, EndpointConfig};
pub use sharding::{HashRing, ModShard, ShardError, Sharder};

#[derive(Debug, Snafu)]
pub enum PoolError {
    #[snafu(display("shard lookup failed: {source}"))]
    Shard { source: ShardError },

    #[snafu(display("no endpoint running for address {addr}"))]
    UnknownEndpoint { addr: String },

    #[snafu(display("failed to build HTTP client: {source}"))]
    Client { source: reqwest::Error },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Discovery target, e.g. `dns+prom-store.internal:9090`.
    pub name: String,
    pub refresh_interval: Duration,
    pub endpoint: EndpointConfig,
}

pub struct EndpointPool {
    name: String,
    endpoint_config: EndpointConfig,
    client: reqwest::Client,
    provider: dns::Provider,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    sharder: RwLock<Box<dyn Sharder>>,
}

impl EndpointPool {
    /// Starts the pool with the production modulo sharder.
    pub fn start(
        config: PoolConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, PoolError> {
        Self::start_with_sharder(config, Box::new(ModShard::new()), shutdown)
    }

    /// Starts the pool with a caller-provided sharding structure and kicks
    /// off the DNS refresh task.
    pub fn start_with_sharder(
        config: PoolConfig,
        sharder: Box<dyn Sharder>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, PoolError> {
        let client = reqwest::Client::builder()
            .timeout(endpoint::SEND_TIMEOUT)
            .pool_max_idle_per_host(30)
            .pool_idle_timeout(Duration::from_secs(600))
            .build()
            .context(ClientSnafu)?;

        let pool = Arc::new(Self {
            name: config.name,
            endpoint_config: config.endpoint,
            client,
            provider: dns::Provider::new(),
            endpoints: RwLock::new(HashMap::new()),
            sharder: RwLock::new(sharder),
        });

        tokio::spawn(refresh_dns(
            Arc::clone(&pool),
            config.refresh_interval,
            shutdown,
        ));
        Ok(pool)
    }

    /// Maps a canonical label-set key to up to `replication` running
    /// endpoints.
    pub fn endpoints_for(
        &self,
        key: &str,
        replication: usize,
    ) -> Result<Vec<Arc<Endpoint>>, PoolError> {
        let addrs = self
            .sharder
            .read()
            .expect("sharder poisoned")
            .get_n(key, replication)
            .context(ShardSnafu)?;

        let endpoints = self.endpoints.read().expect("endpoint map poisoned");
        addrs
            .into_iter()
            .map(|addr| {
                endpoints
                    .get(&addr)
                    .cloned()
                    .ok_or(PoolError::UnknownEndpoint { addr })
            })
            .collect()
    }

    /// One resolution pass: look up the target, then reconcile the endpoint
    /// map and the sharder with the answer under the map's write lock.
    async fn resolve(&self) -> Result<(), dns::DnsError> {
        let resolved = match self.provider.resolve(&self.name).await {
            Ok(resolved) => resolved,
            Err(error) => {
                counter!("backend_sd_dns_failed_total", "name" => self.name.clone()).increment(1);
                return Err(error);
            }
        };

        {
            let mut endpoints = self.endpoints.write().expect("endpoint map poisoned");

            for addr in &resolved {
                if !endpoints.contains_key(addr) {
                    let started = Endpoint::start(
                        addr.clone(),
                        self.endpoint_config.clone(),
                        self.client.clone(),
                    );
                    endpoints.insert(addr.clone(), started);
                }
            }

            endpoints.retain(|addr, endpoint| {
                let keep = resolved.iter().any(|a| a == addr);
                if !keep {
                    endpoint.stop();
                }
                keep
            });

            self.sharder
                .write()
                .expect("sharder poisoned")
                .set_servers(resolved.clone());
            gauge!("backend_endpoint_count").set(endpoints.len() as f64);
        }

        counter!("backend_sd_dns_success_total", "name" => self.name.clone()).increment(1);
        info!(records = %resolved.join(","), "DNS resolved");
        Ok(())
    }

    fn stop_endpoints(&self) {
        let mut endpoints = self.endpoints.write().expect("endpoint map poisoned");
        for (_, endpoint) in endpoints.drain() {
            endpoint.stop();
        }
        gauge!("backend_endpoint_count").set(0.0);
    }

    #[cfg(test)]
    pub(crate) fn running_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .endpoints
            .read()
            .expect("endpoint map poisoned")
            .keys()
            .cloned()
            .collect();
        addrs.sort_unstable();
        addrs
    }
}

async fn refresh_dns(pool: Arc<EndpointPool>, interval: Duration, shutdown: CancellationToken) {
    if let Err(error) = pool.resolve().await {
        error!(%error, "initial DNS resolve failed");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                pool.stop_endpoints();
                return;
            }
            _ = ticker.tick() => {
                if let Err(error) = pool.resolve().await {
                    error!(%error, "DNS resolve failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(name: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_owned(),
            // Long enough that only the initial resolution runs during a
            // test.
            refresh_interval: Duration::from_secs(3600),
            endpoint: EndpointConfig::default(),
        }
    }

    async fn wait_for_endpoints(pool: &EndpointPool, count: usize) {
        for _ in 0..200 {
            if pool.running_addrs().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.running_addrs().len(), count);
    }

    #[tokio::test]
    async fn resolution_starts_endpoints_and_feeds_the_sharder() {
        let shutdown = CancellationToken::new();
        let pool = EndpointPool::start(pool_config("dns+127.0.0.1:19090"), shutdown.clone())
            .unwrap();
        wait_for_endpoints(&pool, 1).await;

        let endpoints = pool
            .endpoints_for(r#"{__name__="up"}"#, 1)
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].addr(), "127.0.0.1:19090");

        shutdown.cancel();
        wait_for_endpoints(&pool, 0).await;
    }

    #[tokio::test]
    async fn repeated_resolution_is_idempotent() {
        let shutdown = CancellationToken::new();
        let pool = EndpointPool::start(pool_config("dns+127.0.0.1:19091"), shutdown.clone())
            .unwrap();
        wait_for_endpoints(&pool, 1).await;

        let before = Arc::as_ptr(&pool.endpoints_for(r#"{__name__="up"}"#, 1).unwrap()[0]);
        pool.resolve().await.unwrap();
        let after = Arc::as_ptr(&pool.endpoints_for(r#"{__name__="up"}"#, 1).unwrap()[0]);

        // The same answer must not restart the endpoint.
        assert_eq!(before, after);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_resolution_changes_nothing() {
        let shutdown = CancellationToken::new();
        let pool = EndpointPool::start(
            pool_config("dns+definitely-not-a-host.invalid:1"),
            shutdown.clone(),
        )
        .unwrap();

        // The error path must not install endpoints or servers.
        assert!(pool.resolve().await.is_err());
        assert!(pool.running_addrs().is_empty());
        assert!(matches!(
            pool.endpoints_for(r#"{__name__="up"}"#, 1),
            Err(PoolError::Shard {
                source: ShardError::NoServers
            })
        ));
        shutdown.cancel();
    }
}
