//! Listener and connection tuning, read from the environment.

use mockgate_core::upstream::PoolSettings;
use std::time::Duration;
use tracing::warn;

/// Socket and concurrency settings for the gRPC listener and the shared
/// backend client.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Disable Nagle's algorithm on accepted and outbound sockets.
    pub tcp_nodelay: bool,

    pub tcp_keepalive_secs: u64,

    /// Connections accepted at once; further connections are dropped until
    /// one finishes.
    pub max_concurrent_streams: usize,

    /// SO_RCVBUF / SO_SNDBUF
    pub socket_buffer_size: usize,

    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            max_concurrent_streams: 10000,
            socket_buffer_size: 262144, // 256 KB
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ProxyConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `MOCKGATE_TCP_NODELAY` (default: true)
    /// - `MOCKGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `MOCKGATE_MAX_CONCURRENT_STREAMS` (default: 10000)
    /// - `MOCKGATE_SOCKET_BUFFER_SIZE` (default: 262144)
    /// - `MOCKGATE_POOL_MAX_IDLE_PER_HOST` (default: 32)
    /// - `MOCKGATE_POOL_IDLE_TIMEOUT_SECS` (default: 90)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            tcp_nodelay: parse_env_warn("MOCKGATE_TCP_NODELAY", default.tcp_nodelay),
            tcp_keepalive_secs: parse_env_warn(
                "MOCKGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),
            max_concurrent_streams: parse_env_warn(
                "MOCKGATE_MAX_CONCURRENT_STREAMS",
                default.max_concurrent_streams,
            ),
            socket_buffer_size: parse_env_warn(
                "MOCKGATE_SOCKET_BUFFER_SIZE",
                default.socket_buffer_size,
            ),
            pool_max_idle_per_host: parse_env_warn(
                "MOCKGATE_POOL_MAX_IDLE_PER_HOST",
                default.pool_max_idle_per_host,
            ),
            pool_idle_timeout: Duration::from_secs(parse_env_warn(
                "MOCKGATE_POOL_IDLE_TIMEOUT_SECS",
                default.pool_idle_timeout.as_secs(),
            )),
        }
    }

    /// Settings for the shared backend client.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            tcp_nodelay: self.tcp_nodelay,
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            pool_idle_timeout: self.pool_idle_timeout,
        }
    }
}

/// Parse an environment variable, warning and using `default` when the value
/// does not parse.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
