//! Process-wide default values with environment overrides.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockGateDefaults {
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Time in-flight calls get to finish. Must be below `shutdown_timeout`.
    pub drain_timeout: Duration,

    /// Wait between successful snapshot rebuilds.
    pub reload_interval: Duration,

    /// Wait after a failed rebuild.
    pub reload_retry_backoff: Duration,
}

impl Default for MockGateDefaults {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
            reload_interval: Duration::from_millis(3000),
            reload_retry_backoff: Duration::from_millis(1000),
        }
    }
}

impl MockGateDefaults {
    /// Defaults overridden by `MOCKGATE_SHUTDOWN_TIMEOUT_SECS`,
    /// `MOCKGATE_DRAIN_TIMEOUT_SECS` and `MOCKGATE_RELOAD_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "MOCKGATE_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),
            drain_timeout: Duration::from_secs(parse_env_warn(
                "MOCKGATE_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),
            reload_interval: Duration::from_millis(parse_env_warn(
                "MOCKGATE_RELOAD_INTERVAL_MS",
                default.reload_interval.as_millis() as u64,
            )),
            reload_retry_backoff: default.reload_retry_backoff,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.drain_timeout >= self.shutdown_timeout {
            return Err(format!(
                "drain_timeout ({:?}) must be less than shutdown_timeout ({:?})",
                self.drain_timeout, self.shutdown_timeout
            ));
        }
        if self.reload_interval.is_zero() {
            return Err("reload_interval must be greater than zero".to_string());
        }
        Ok(())
    }
}

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
