//! A buffering, sharding ingestion proxy for Prometheus remote write.
//!
//! Producers deliver samples over two HTTP entry points (remote-write and a
//! push-gateway surface); payloads are buffered in a durable disk queue (or
//! a bounded in-memory one), decoded by a worker pool, guarded by a
//! cardinality filter, partitioned by label-set fingerprint across a
//! DNS-discovered pool of storage backends, and re-emitted in batches with
//! bounded concurrency and rollback on transient failure.

pub mod app;
pub mod backend;
pub mod config;
pub mod consumer;
pub mod dns;
pub mod filter;
pub mod http;
pub mod labels;
pub mod proto;
pub mod queue;
pub mod worker;
