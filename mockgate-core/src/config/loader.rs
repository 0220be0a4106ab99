//! Configuration loading and validation.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::Config;
use crate::rule::Rule;

/// Search paths after an explicit `--config`, in priority order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(path) = std::env::var("MOCKGATE_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/mockgate/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));
    paths
}

/// Locate the configuration file.
///
/// An explicit path must exist. Without one, `Ok(None)` means no file was
/// found and the process runs on defaults.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    Ok(default_config_paths().into_iter().find(|p| p.exists()))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }
    let contents = substitute_env_vars(&contents)?;
    Ok(serde_saphyr::from_str(&contents)?)
}

pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern,
// covered by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Replace `${VAR}` (required) and `${VAR:-default}` references.
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var = &cap[1];
        match (std::env::var(var), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }
    Ok(result.into_owned())
}

pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    if config.max_frame_bytes == 0 {
        return Err(ConfigError::ZeroValue {
            field: "max_frame_bytes",
        });
    }
    if config.reload.interval_ms == Some(0) {
        return Err(ConfigError::ZeroValue {
            field: "reload.interval_ms",
        });
    }
    if config.reload.retry_backoff_ms == Some(0) {
        return Err(ConfigError::ZeroValue {
            field: "reload.retry_backoff_ms",
        });
    }

    let keys = &config.matching.keys;
    for (field, value) in [
        ("enable_key", &keys.enable_key),
        ("custom_case_key", &keys.custom_case_key),
        ("app_key", &keys.app_key),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyMatchKey { field });
        }
    }
    if keys.case_keys.iter().all(|k| k.trim().is_empty()) {
        return Err(ConfigError::EmptyMatchKey { field: "case_keys" });
    }

    let mut seen_upstreams = HashSet::new();
    for upstream in &config.upstreams {
        if upstream.name.trim().is_empty() {
            return Err(ConfigError::EmptyUpstreamName);
        }
        if !seen_upstreams.insert(upstream.name.as_str()) {
            return Err(ConfigError::DuplicateUpstream {
                name: upstream.name.clone(),
            });
        }
        match upstream.endpoints.len() {
            0 => {
                return Err(ConfigError::NoEndpoints {
                    name: upstream.name.clone(),
                });
            }
            1 => {}
            count => warnings.push(ValidationWarning::ExtraEndpointsIgnored {
                upstream: upstream.name.clone(),
                count,
            }),
        }
    }

    let mut seen_cases = HashSet::new();
    for (index, case) in config.cases.iter().enumerate() {
        for (field, value) in [
            ("app", &case.app),
            ("method", &case.method),
            ("name", &case.name),
        ] {
            if value.is_empty() {
                return Err(ConfigError::EmptyCaseField { index, field });
            }
        }
        if !seen_cases.insert(case.key()) {
            return Err(ConfigError::DuplicateCase {
                app: case.app.clone(),
                method: case.method.clone(),
                name: case.name.clone(),
            });
        }
        if case.rule.trim().is_empty() {
            warnings.push(ValidationWarning::CaseWithoutRule {
                app: case.app.clone(),
                name: case.name.clone(),
            });
        } else if let Err(source) = Rule::compile(&case.rule) {
            return Err(ConfigError::InvalidCaseRule {
                app: case.app.clone(),
                name: case.name.clone(),
                source,
            });
        }
    }

    Ok(ValidationResult::with_warnings(warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(yaml: &str) -> Config {
        serde_saphyr::from_str(yaml).unwrap()
    }

    #[test]
    fn test_env_var_pattern_compiles() {
        assert!(ENV_VAR_PATTERN.is_match("${A:-b}"));
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        let out = substitute_env_vars("token: ${MOCKGATE_TEST_UNSET_TOKEN:-fallback}").unwrap();
        assert_eq!(out, "token: fallback");

        let out = substitute_env_vars("token: ${MOCKGATE_TEST_UNSET_TOKEN:-}").unwrap();
        assert_eq!(out, "token: ");
    }

    #[test]
    fn test_env_var_substitution_missing_required() {
        let err = substitute_env_vars("token: ${MOCKGATE_TEST_UNSET_REQUIRED}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var, .. } if var == "MOCKGATE_TEST_UNSET_REQUIRED"));
    }

    #[test]
    fn test_env_var_substitution_reads_environment() {
        // PATH is set in every test environment.
        let path = std::env::var("PATH").unwrap();
        assert_eq!(substitute_env_vars("${PATH}").unwrap(), path);
    }

    #[test]
    fn test_unsupported_schema_version() {
        let config = parse("schema: 2\n");
        assert!(matches!(
            validate(&config),
            Err(ConfigError::UnsupportedSchemaVersion { version: 2 })
        ));
    }

    #[test]
    fn test_validate_duplicate_upstream() {
        let config = parse(
            r#"
schema: 1
upstreams:
  - name: users
    endpoints: ["a:1"]
  - name: users
    endpoints: ["b:1"]
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicateUpstream { name }) if name == "users"
        ));
    }

    #[test]
    fn test_validate_upstream_without_endpoints() {
        let config = parse("schema: 1\nupstreams:\n  - name: users\n    endpoints: []\n");
        assert!(matches!(validate(&config), Err(ConfigError::NoEndpoints { .. })));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = parse("schema: 1\nreload:\n  interval_ms: 0\n");
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ZeroValue { field: "reload.interval_ms" })
        ));
    }

    #[test]
    fn test_validate_bad_case_rule() {
        let config = parse(
            r#"
schema: 1
cases:
  - app: checkout
    method: /users.Users/Get
    name: broken
    rule: "id =="
    body: {}
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidCaseRule { name, .. }) if name == "broken"
        ));
    }

    #[test]
    fn test_validate_warnings() {
        let config = parse(
            r#"
schema: 1
upstreams:
  - name: users
    endpoints: ["a:1", "b:1"]
cases:
  - tested_app_name: checkout
    method: /users.Users/Get
    case_name: plain
    body: {name: "x"}
"#,
        );
        let result = validate(&config).unwrap();
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(config.cases[0].app, "checkout");
        assert_eq!(config.cases[0].body["name"], "x");
    }

    #[test]
    fn test_load_and_validate_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"schema: 1
max_frame_bytes: 1024
upstreams:
  - name: users
    endpoints: ["users.internal:50051"]
    token: ${{MOCKGATE_TEST_UNSET_TOKEN:-dev-token}}
"#
        )
        .unwrap();

        let (config, result) = load_and_validate(file.path()).unwrap();
        assert!(result.is_clean());
        assert_eq!(config.max_frame_bytes, 1024);
        assert_eq!(config.upstreams[0].token.as_deref(), Some("dev-token"));
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::EmptyConfigFile)));
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let err = find_config_file(Some(Path::new("/nonexistent/mockgate.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { .. }));
    }
}
