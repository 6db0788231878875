//! Configuration management
//!
//! TOML configuration with per-field defaults and startup validation.
//! Durations are configured in milliseconds and exposed as [`Duration`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Query service limits
    #[serde(default)]
    pub query: QuerySettings,

    /// Global telnet fleet configuration
    #[serde(default)]
    pub telnet: TelnetSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Address the HTTP API binds to
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Port peers are expected to serve the control endpoints on
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Query service limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuerySettings {
    /// Maximum timeseries a single sub-query may fan out to
    #[serde(default = "default_max_timeseries")]
    pub max_timeseries: usize,

    /// Capacity of the per-query timeseries gate
    #[serde(default = "default_max_concurrent_timeseries")]
    pub max_concurrent_timeseries: usize,

    /// Capacity of the global storage reads gate
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads: usize,

    /// Emit a log entry when a query matches more than this many timeseries
    #[serde(default = "default_log_query_threshold")]
    pub log_query_threshold: usize,

    /// Storage TTL bucket used when a query carries no `ttl` filter
    #[serde(default = "default_ttl")]
    pub default_ttl: i32,

    /// Default result cap for suggest requests
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,

    /// Deadline for a full query request, in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl QuerySettings {
    /// Deadline applied to each query request
    pub fn query_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_timeout_ms)
    }
}

/// Global telnet fleet configuration, shared by every server on the node
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelnetSettings {
    /// This node's name; peers matching it are removed from `nodes`.
    /// Defaults to the `HOSTNAME` environment variable.
    #[serde(default)]
    pub node_name: Option<String>,

    /// All nodes participating in connection balancing (including this one)
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Interval between balancer ticks, in milliseconds
    #[serde(default = "default_balance_check_interval_ms")]
    pub conns_balance_check_interval_ms: u64,

    /// How long a shed waits for excess connections to drop, in milliseconds
    #[serde(default = "default_wait_for_drop_ms")]
    pub max_wait_for_drop_conns_interval_ms: u64,

    /// Timeout for peer HEAD requests, in milliseconds
    #[serde(default = "default_http_request_timeout_ms")]
    pub http_request_timeout_ms: u64,

    /// How long a halted node waits before resuming balancing, in milliseconds
    #[serde(default = "default_wait_other_node_ms")]
    pub max_wait_for_other_node_balancing_ms: u64,

    /// Hard cap on accepted telnet connections across all servers
    #[serde(default = "default_max_telnet_connections")]
    pub max_connections: u32,

    /// Hysteresis: shed only when local exceeds the peer average by at
    /// least this many connections
    #[serde(default = "default_max_unbalanced")]
    pub max_unbalanced_conns_per_node: u32,

    /// Capacity of the close-request token queue
    #[serde(default = "default_close_channel_size")]
    pub close_channel_size: usize,

    /// Telnet listeners to start
    #[serde(default)]
    pub servers: Vec<TelnetServerSettings>,
}

/// Per-listener telnet configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelnetServerSettings {
    /// Server name, used in logs
    pub name: String,

    /// Address the listener binds to
    pub listen: String,
}

// Default value functions
fn default_http_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_http_port() -> u16 {
    8787
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_timeseries() -> usize {
    5000
}
fn default_max_concurrent_timeseries() -> usize {
    50
}
fn default_max_concurrent_reads() -> usize {
    100
}
fn default_log_query_threshold() -> usize {
    1000
}
fn default_ttl() -> i32 {
    90
}
fn default_max_results() -> usize {
    25
}
fn default_query_timeout_ms() -> u64 {
    30_000
}
fn default_balance_check_interval_ms() -> u64 {
    10_000
}
fn default_wait_for_drop_ms() -> u64 {
    5_000
}
fn default_http_request_timeout_ms() -> u64 {
    2_000
}
fn default_wait_other_node_ms() -> u64 {
    30_000
}
fn default_max_telnet_connections() -> u32 {
    10_000
}
fn default_max_unbalanced() -> u32 {
    5
}
fn default_close_channel_size() -> usize {
    1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            http_port: default_http_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_timeseries: default_max_timeseries(),
            max_concurrent_timeseries: default_max_concurrent_timeseries(),
            max_concurrent_reads: default_max_concurrent_reads(),
            log_query_threshold: default_log_query_threshold(),
            default_ttl: default_ttl(),
            default_max_results: default_max_results(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for TelnetSettings {
    fn default() -> Self {
        Self {
            node_name: None,
            nodes: Vec::new(),
            conns_balance_check_interval_ms: default_balance_check_interval_ms(),
            max_wait_for_drop_conns_interval_ms: default_wait_for_drop_ms(),
            http_request_timeout_ms: default_http_request_timeout_ms(),
            max_wait_for_other_node_balancing_ms: default_wait_other_node_ms(),
            max_connections: default_max_telnet_connections(),
            max_unbalanced_conns_per_node: default_max_unbalanced(),
            close_channel_size: default_close_channel_size(),
            servers: Vec::new(),
        }
    }
}

impl TelnetSettings {
    /// Interval between balancer ticks
    pub fn balance_check_interval(&self) -> Duration {
        Duration::from_millis(self.conns_balance_check_interval_ms)
    }

    /// How long a shed waits for connections to drop
    pub fn wait_for_drop_interval(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_drop_conns_interval_ms)
    }

    /// Timeout applied to each peer HEAD request
    pub fn http_request_timeout(&self) -> Duration {
        Duration::from_millis(self.http_request_timeout_ms)
    }

    /// Back-off after a shed was skipped because the node is halted
    pub fn wait_for_other_node_balancing(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_other_node_balancing_ms)
    }

    /// This node's name, falling back to the `HOSTNAME` environment variable
    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

impl Settings {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::init(format!("cannot read config file {path}: {e}")))?;

        toml::from_str(&contents)
            .map_err(|e| crate::Error::init(format!("cannot parse config file {path}: {e}")))
    }

    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.query.max_timeseries == 0 {
            return Err(crate::Error::init("max_timeseries must be bigger than zero"));
        }
        if self.query.max_concurrent_reads == 0 {
            return Err(crate::Error::init(
                "max_concurrent_reads must be bigger than zero",
            ));
        }
        if self.query.log_query_threshold == 0 {
            return Err(crate::Error::init(
                "log_query_threshold must be bigger than zero",
            ));
        }
        if self.query.max_concurrent_timeseries > self.query.max_concurrent_reads {
            return Err(crate::Error::init(
                "max_concurrent_timeseries cannot be bigger than max_concurrent_reads",
            ));
        }
        if self.telnet.close_channel_size == 0 {
            return Err(crate::Error::init(
                "close_channel_size must be bigger than zero",
            ));
        }
        Ok(())
    }
}
