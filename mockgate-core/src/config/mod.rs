//! Process configuration: YAML file, environment overrides, defaults.

mod defaults;
mod error;
mod loader;
mod schema;

pub use defaults::MockGateDefaults;
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{
    default_config_paths, find_config_file, load_and_validate, load_config, substitute_env_vars,
    validate,
};
pub use schema::{Config, MatchConfig, ReloadConfig};
