//! Shard selection: mapping a canonical label-set key to backend addresses.

use snafu::Snafu;

use crate::labels;

#[derive(Debug, Snafu)]
pub enum ShardError {
    #[snafu(display("no backend servers configured"))]
    NoServers,

    #[snafu(display("unparseable shard key: {source}"))]
    BadKey { source: promtext::ParseError },
}

/// Pluggable shard lookup. `set_servers` replaces the server set wholesale on
/// each discovery refresh; `get_n` maps a canonical label-set key to up to
/// `n` distinct addresses.
pub trait Sharder: Send + Sync {
    fn get_n(&self, key: &str, n: usize) -> Result<Vec<String>, ShardError>;
    fn set_servers(&mut self, servers: Vec<String>);
}

/// Production sharding: 64-bit fingerprint of the canonical label set,
/// reduced modulo the server count.
///
/// Replication walks forward from the home shard, so `n = 1` (the default)
/// picks exactly the modulo slot.
#[derive(Debug, Default)]
pub struct ModShard {
    servers: Vec<String>,
}

impl ModShard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sharder for ModShard {
    fn get_n(&self, key: &str, n: usize) -> Result<Vec<String>, ShardError> {
        let labels = promtext::parse_label_set(key).map_err(|source| ShardError::BadKey { source })?;
        if self.servers.is_empty() {
            return Err(ShardError::NoServers);
        }

        let fingerprint = labels::fingerprint(&labels::canonical_string(&labels));
        let start = (fingerprint % self.servers.len() as u64) as usize;
        let count = n.clamp(1, self.servers.len());

        Ok((0..count)
            .map(|offset| self.servers[(start + offset) % self.servers.len()].clone())
            .collect())
    }

    fn set_servers(&mut self, mut servers: Vec<String>) {
        servers.sort_unstable();
        self.servers = servers;
    }
}

/// Virtual nodes per server on the CRC32 ring.
const RING_REPLICAS: usize = 64;

/// Consistent-hash alternative: a CRC32 ring with virtual nodes, trading the
/// modulo map's simplicity for smoother rebalancing when the server set
/// changes.
#[derive(Debug, Default)]
pub struct HashRing {
    ring: Vec<(u32, usize)>,
    servers: Vec<String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sharder for HashRing {
    fn get_n(&self, key: &str, n: usize) -> Result<Vec<String>, ShardError> {
        promtext::parse_label_set(key).map_err(|source| ShardError::BadKey { source })?;
        if self.servers.is_empty() {
            return Err(ShardError::NoServers);
        }

        let hash = crc32fast::hash(key.as_bytes());
        let start = match self.ring.binary_search_by_key(&hash, |(point, _)| *point) {
            Ok(i) => i,
            Err(i) => i % self.ring.len(),
        };

        let count = n.clamp(1, self.servers.len());
        let mut picked = Vec::with_capacity(count);
        let mut seen = vec![false; self.servers.len()];
        for &(_, server) in self.ring[start..].iter().chain(&self.ring[..start]) {
            if !seen[server] {
                seen[server] = true;
                picked.push(self.servers[server].clone());
                if picked.len() == count {
                    break;
                }
            }
        }
        Ok(picked)
    }

    fn set_servers(&mut self, mut servers: Vec<String>) {
        servers.sort_unstable();
        let mut ring = Vec::with_capacity(servers.len() * RING_REPLICAS);
        for (index, server) in servers.iter().enumerate() {
            for replica in 0..RING_REPLICAS {
                let point = crc32fast::hash(format!("{server}\x00{replica}").as_bytes());
                ring.push((point, index));
            }
        }
        ring.sort_unstable();
        self.ring = ring;
        self.servers = servers;
    }
}
