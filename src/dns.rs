//! DNS-based backend discovery.
//!
//! Backend targets are written as `<qtype>+<name>`, e.g.
//! `dns+prom-store.internal:9090`. Only `dns+` (A/AAAA through the system
//! resolver) is supported today; `srv+` is reserved. The provider caches the
//! last successful answer per target so a transient resolver outage does not
//! collapse routing.

use std::collections::HashMap;
use std::sync::RwLock;

use snafu::Snafu;
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum DnsError {
    #[snafu(display("missing DNS query type in {addr:?} (expected e.g. \"dns+host:port\")"))]
    MissingQType { addr: String },

    #[snafu(display("unsupported DNS query type {qtype:?}"))]
    UnsupportedQType { qtype: String },

    #[snafu(display("resolving {name:?} failed: {source}"))]
    Lookup {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("{name:?} resolved to no addresses"))]
    EmptyAnswer { name: String },
}

/// Splits `dns+host:port` into the query type (if any) and the name.
pub fn qtype_name(addr: &str) -> (Option<&str>, &str) {
    match addr.split_once('+') {
        Some((qtype, name)) => (Some(qtype), name),
        None => (None, addr),
    }
}

/// Stateful cache of asynchronous DNS resolutions.
pub struct Provider {
    resolved: RwLock<HashMap<String, Vec<String>>>,
}

impl Provider {
    pub fn new() -> Self {
        Self {
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves `addr` to a sorted list of `ip:port` strings.
    ///
    /// On lookup failure the last successful answer for the same target is
    /// returned if one exists, so the caller's routing keeps its current
    /// shape until the resolver recovers.
    pub async fn resolve(&self, addr: &str) -> Result<Vec<String>, DnsError> {
        let (qtype, name) = qtype_name(addr);
        match qtype {
            Some("dns") => {}
            Some(qtype) => {
                return Err(DnsError::UnsupportedQType {
                    qtype: qtype.to_owned(),
                })
            }
            None => {
                return Err(DnsError::MissingQType {
                    addr: addr.to_owned(),
                })
            }
        }

        match lookup(name).await {
            Ok(resolved) => {
                self.resolved
                    .write()
                    .expect("resolver cache poisoned")
                    .insert(addr.to_owned(), resolved.clone());
                Ok(resolved)
            }
            Err(error) => {
                warn!(%error, target = addr, "DNS lookup failed, falling back to cached answer");
                self.resolved
                    .read()
                    .expect("resolver cache poisoned")
                    .get(addr)
                    .cloned()
                    .ok_or(error)
            }
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Self::new()
    }
}

async fn lookup(name: &str) -> Result<Vec<String>, DnsError> {
    let addrs = tokio::net::lookup_host(name)
        .await
        .map_err(|source| DnsError::Lookup {
            name: name.to_owned(),
            source,
        })?;

    let mut resolved: Vec<String> = addrs.map(|addr| addr.to_string()).collect();
    if resolved.is_empty() {
        return Err(DnsError::EmptyAnswer {
            name: name.to_owned(),
        });
    }
    resolved.sort_unstable();
    resolved.dedup();
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_qtype_and_name() {
        assert_eq!(qtype_name("dns+example.com:9090"), (Some("dns"), "example.com:9090"));
        assert_eq!(qtype_name("example.com:9090"), (None, "example.com:9090"));
        assert_eq!(qtype_name("srv+_prom._tcp.example.com"), (Some("srv"), "_prom._tcp.example.com"));
    }

    #[tokio::test]
    async fn rejects_missing_and_unsupported_qtypes() {
        let provider = Provider::new();
        assert!(matches!(
            provider.resolve("example.com:9090").await,
            Err(DnsError::MissingQType { .. })
        ));
        assert!(matches!(
            provider.resolve("srv+example.com").await,
            Err(DnsError::UnsupportedQType { .. })
        ));
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let provider = Provider::new();
        let resolved = provider.resolve("dns+127.0.0.1:9201").await.unwrap();
        assert_eq!(resolved, vec!["127.0.0.1:9201".to_string()]);
    }

    #[tokio::test]
    async fn cold_lookup_failure_surfaces() {
        // With nothing cached for the target there is no answer to fall back
        // to, so the failure must reach the caller.
        let provider = Provider::new();
        let missing = provider.resolve("dns+definitely-not-a-host.invalid:1").await;
        assert!(missing.is_err());
    }
}
