//! Configuration file schema.
//!
//! ```yaml
//! schema: 1
//! match:
//!   enable_key: mock
//!   app_key: tested_app_name
//!   enums_as_ints: true
//! reload:
//!   interval_ms: 3000
//!   retry_backoff_ms: 1000
//! max_frame_bytes: 4194304
//! upstreams:
//!   - name: users
//!     endpoints: ["users.internal:50051"]
//!     token: ${USERS_TOKEN:-}
//! cases:
//!   - tested_app_name: checkout
//!     method: /users.Users/Get
//!     case_name: vip
//!     rule: "id == 42"
//!     body: { name: "vip" }
//! ```

use serde::Deserialize;
use std::time::Duration;

use super::defaults::MockGateDefaults;
use crate::grpc::DEFAULT_MAX_FRAME_BYTES;
use crate::matching::MatchKeys;
use crate::reload::ReloadSettings;
use crate::store::{Case, UpstreamConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub schema: u32,

    #[serde(default, rename = "match")]
    pub matching: MatchConfig,

    #[serde(default)]
    pub reload: ReloadConfig,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub cases: Vec<Case>,
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: 1,
            matching: MatchConfig::default(),
            reload: ReloadConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            upstreams: Vec::new(),
            cases: Vec::new(),
        }
    }
}

impl Config {
    /// Reload timing: file values win, then the process defaults.
    pub fn reload_settings(&self, defaults: &MockGateDefaults) -> ReloadSettings {
        ReloadSettings {
            interval: self
                .reload
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reload_interval),
            retry_backoff: self
                .reload
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reload_retry_backoff),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MatchConfig {
    #[serde(flatten)]
    pub keys: MatchKeys,

    /// Render enums as numbers in the JSON that rules see.
    #[serde(default = "default_enums_as_ints")]
    pub enums_as_ints: bool,
}

fn default_enums_as_ints() -> bool {
    true
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            keys: MatchKeys::default(),
            enums_as_ints: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReloadConfig {
    pub interval_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
}
