//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::rule::RuleError;

#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Upstream seeds
    // ─────────────────────────────────────────────────────────────────────────
    #[error("upstream name must not be empty")]
    EmptyUpstreamName,

    #[error("duplicate upstream: '{name}'")]
    DuplicateUpstream { name: String },

    #[error("upstream '{name}' has no endpoints")]
    NoEndpoints { name: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Case seeds
    // ─────────────────────────────────────────────────────────────────────────
    #[error("case #{index}: {field} must not be empty")]
    EmptyCaseField { index: usize, field: &'static str },

    #[error("duplicate case '{name}' for app '{app}' on {method}")]
    DuplicateCase {
        app: String,
        method: String,
        name: String,
    },

    #[error("case '{name}' for app '{app}' has an invalid rule: {source}")]
    InvalidCaseRule {
        app: String,
        name: String,
        #[source]
        source: RuleError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Values
    // ─────────────────────────────────────────────────────────────────────────
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("match key '{field}' must not be empty")]
    EmptyMatchKey { field: &'static str },

    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing
    // ─────────────────────────────────────────────────────────────────────────
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Non-fatal findings from validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Only the first endpoint of an upstream receives traffic.
    ExtraEndpointsIgnored { upstream: String, count: usize },
    /// A seed case without a rule is only reachable by naming it in metadata.
    CaseWithoutRule { app: String, name: String },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExtraEndpointsIgnored { upstream, count } => {
                write!(
                    f,
                    "upstream '{upstream}' lists {count} endpoints; only the first is used"
                )
            }
            Self::CaseWithoutRule { app, name } => {
                write!(f, "case '{name}' for app '{app}' has no rule and only matches by name")
            }
        }
    }
}

#[derive(Debug)]
pub struct ValidationResult {
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(warnings: Vec<ValidationWarning>) -> Self {
        Self { warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
