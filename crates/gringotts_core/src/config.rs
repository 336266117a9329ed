//! Storage and logging configuration.
//!
//! # Responsibility
//! - Collect database location, timeouts and logging settings in one value.
//! - Read overrides from the process environment.
//!
//! # Invariants
//! - Every field has a usable default; the environment only overrides.
//! - Timeouts are given in milliseconds and must be greater than zero.

use crate::db::ConnectOptions;
use crate::logging::default_log_level;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DB_PATH: &str = "DB_PATH";
pub const ENV_LIVENESS_TIMEOUT_MS: &str = "DB_LIVENESS_TIMEOUT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "DB_BUSY_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "LOG_DIR";

const DEFAULT_DB_FILE_NAME: &str = "gringotts.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid value `{value}` for {key}: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Settings needed to open the store and start logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub connect: ConnectOptions,
    pub log_level: String,
    /// Logging stays off when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE_NAME),
            connect: ConnectOptions::default(),
            log_level: default_log_level().to_string(),
            log_dir: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `DB_PATH`, `DB_LIVENESS_TIMEOUT_MS`,
    /// `DB_BUSY_TIMEOUT_MS`, `LOG_LEVEL` and `LOG_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(path) = non_blank(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = non_blank(ENV_LIVENESS_TIMEOUT_MS) {
            config.connect.liveness_timeout = parse_timeout_ms(ENV_LIVENESS_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = non_blank(ENV_BUSY_TIMEOUT_MS) {
            config.connect.busy_timeout = parse_timeout_ms(ENV_BUSY_TIMEOUT_MS, &raw)?;
        }
        if let Some(level) = non_blank(ENV_LOG_LEVEL) {
            config.log_level = level.trim().to_string();
        }
        config.log_dir = non_blank(ENV_LOG_DIR).map(PathBuf::from);

        Ok(config)
    }
}

fn parse_timeout_ms(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason,
    };
    let millis: u64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a whole number of milliseconds"))?;
    if millis == 0 {
        return Err(invalid("timeout must be greater than zero"));
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, StoreConfig, ENV_BUSY_TIMEOUT_MS, ENV_LIVENESS_TIMEOUT_MS};
    use crate::db::{DEFAULT_BUSY_TIMEOUT, DEFAULT_LIVENESS_TIMEOUT};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.connect.liveness_timeout, DEFAULT_LIVENESS_TIMEOUT);
        assert_eq!(config.connect.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("DB_PATH", "/var/lib/gringotts/bank.db"),
            ("DB_LIVENESS_TIMEOUT_MS", "250"),
            ("DB_BUSY_TIMEOUT_MS", "1500"),
            ("LOG_LEVEL", " warn "),
            ("LOG_DIR", "/var/log/gringotts"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/gringotts/bank.db"));
        assert_eq!(config.connect.liveness_timeout, Duration::from_millis(250));
        assert_eq!(config.connect.busy_timeout, Duration::from_millis(1500));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/gringotts")));
    }

    #[test]
    fn malformed_or_zero_timeouts_are_rejected() {
        let err = StoreConfig::from_lookup(lookup(&[(ENV_LIVENESS_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: ENV_LIVENESS_TIMEOUT_MS,
                ..
            }
        ));

        let err = StoreConfig::from_lookup(lookup(&[(ENV_BUSY_TIMEOUT_MS, "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }
}
