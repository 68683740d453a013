//! YAML configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("unable to read configuration file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to parse configuration file {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(rename = "SD", default)]
    pub sd: SdConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        serde_yaml::from_str(&contents).context(ParseSnafu { path })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Listen address, e.g. `0.0.0.0:9201`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Request body ceiling in bytes; 0 disables the check.
    #[serde(default = "default_body_size_limit")]
    pub max_body_size_limit: usize,
    /// Ingest requests admitted per second; 0 disables rate limiting.
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub push_gateway_enable: bool,
    #[serde(default)]
    pub query_enable: bool,
    /// Backend the query endpoints proxy to, e.g. `127.0.0.1:9090`.
    #[serde(default)]
    pub query_addr: String,
    /// Distinct series admitted per flush interval; 0 disables the filter.
    #[serde(default)]
    pub max_series_count_limit: u64,
    /// Seconds between cardinality filter resets.
    #[serde(default = "default_series_flush_interval")]
    pub series_count_flush_interval: u64,
    /// Accepted for compatibility; profiling endpoints are not served.
    #[serde(default)]
    pub pprof: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_size_limit: default_body_size_limit(),
            rate_limit: 0,
            push_gateway_enable: false,
            query_enable: false,
            query_addr: String::new(),
            max_series_count_limit: 0,
            series_count_flush_interval: default_series_flush_interval(),
            pprof: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdConfig {
    /// Discovery target, e.g. `dns+prom-store.internal:9090`.
    #[serde(default)]
    pub name: String,
    /// Seconds between DNS refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default = "default_worker_num")]
    pub num: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num: default_worker_num(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(rename = "type", default = "default_queue_kind")]
    pub kind: QueueKind,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_queue_data_path")]
    pub data_path: PathBuf,
    /// Largest message accepted by the disk queue, in bytes.
    #[serde(default = "default_msg_size_limit")]
    pub msg_size_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: default_queue_kind(),
            name: default_queue_name(),
            data_path: default_queue_data_path(),
            msg_size_limit: default_msg_size_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9201".to_owned()
}

fn default_body_size_limit() -> usize {
    10 * 1024 * 1024
}

fn default_series_flush_interval() -> u64 {
    3600
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_worker_num() -> usize {
    4
}

fn default_queue_kind() -> QueueKind {
    QueueKind::Disk
}

fn default_queue_name() -> String {
    "promrelay".to_owned()
}

fn default_queue_data_path() -> PathBuf {
    PathBuf::from("/var/lib/promrelay")
}

fn default_msg_size_limit() -> u32 {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_owned()
}
