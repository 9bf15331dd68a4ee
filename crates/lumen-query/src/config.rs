//! Engine configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lumen_db::PoolSettings;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ROWS: usize = 10_000;
/// Upper bound on `pageSize` regardless of configuration.
pub const MAX_PAGE_SIZE: u64 = 10_000;
pub const DEFAULT_LOG_SQL_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-request limits applied when the request does not set its own.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    pub default_timeout_ms: u64,
    pub default_max_rows: usize,
    pub max_page_size: u64,
    /// SQL is cut to this many characters in log lines.
    pub log_sql_chars: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_max_rows: DEFAULT_MAX_ROWS,
            max_page_size: MAX_PAGE_SIZE,
            log_sql_chars: DEFAULT_LOG_SQL_CHARS,
        }
    }
}

impl QueryLimits {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Overrides container detection for host normalization.
    pub in_container: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub limits: QueryLimits,
    pub environment: EnvironmentSettings,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid("pool.max_size must be at least 1".into()));
        }
        if self.pool.connect_timeout_ms == 0 || self.pool.admin_connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("pool connect timeouts must be positive".into()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.limits.max_page_size) {
            return Err(ConfigError::Invalid(format!(
                "limits.max_page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.limits.default_max_rows == 0 || self.limits.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "limits.default_max_rows and limits.default_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.pool.max_size, 20);
        assert_eq!(config.pool.idle_timeout_ms, 30_000);
        assert_eq!(config.limits.max_page_size, 10_000);
        assert_eq!(config.environment.in_container, None);
    }

    #[test]
    fn sections_override_individually() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            max_size = 5
            ssl_root_cert = "/etc/lumen/ca.pem"

            [limits]
            default_max_rows = 500

            [environment]
            in_container = true
            "#,
        )
        .expect("config");
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.pool.connect_timeout_ms, 2_000);
        assert_eq!(
            config.pool.ssl_root_cert.as_deref(),
            Some(Path::new("/etc/lumen/ca.pem"))
        );
        assert_eq!(config.limits.default_max_rows, 500);
        assert_eq!(config.limits.default_timeout_ms, 30_000);
        assert_eq!(config.environment.in_container, Some(true));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("[limits]\nmax_page_size = 20000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[pool]\nmax_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[pool]\nmax_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_files() {
        let err = EngineConfig::load("/nonexistent/lumen.toml").expect_err("missing file");
        assert!(err.to_string().starts_with("cannot read config file /nonexistent/lumen.toml"));
    }
}
