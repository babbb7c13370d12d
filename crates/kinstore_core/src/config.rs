//! Store configuration consumed by the bootstrap code.
//!
//! # Responsibility
//! - Select exactly one storage backend per deployment.
//! - Bound setup and teardown calls with explicit timeouts.
//!
//! # Invariants
//! - `pool_size >= 2`: paginated lists check out two connections at once.
//! - All timeouts are non-zero.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MIN_POOL_SIZE: usize = 2;

/// Storage engine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// JSON documents in collections, transactions through sessions.
    Document,
    /// Normalized tables, native connection-bound transactions.
    Relational,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Relational => "relational",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" | "doc" | "mongo" => Ok(Self::Document),
            "relational" | "sql" | "postgres" => Ok(Self::Relational),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    UnknownBackend(String),
    EmptyDatabasePath,
    PoolTooSmall { pool_size: usize, minimum: usize },
    ZeroTimeout(&'static str),
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownBackend(value) => write!(f, "unknown storage backend `{value}`"),
            Self::EmptyDatabasePath => write!(f, "database_path must not be empty"),
            Self::PoolTooSmall { pool_size, minimum } => {
                write!(f, "pool_size {pool_size} is below the minimum of {minimum}")
            }
            Self::ZeroTimeout(name) => write!(f, "{name} must be greater than zero"),
            Self::Parse(err) => write!(f, "invalid store config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

/// Connection and timeout knobs for one store.
///
/// Timeouts are in milliseconds so the struct maps 1:1 onto JSON config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub database_path: PathBuf,
    pub pool_size: usize,
    /// Bounds opening a connection (lock waits during bootstrap).
    pub connect_timeout_ms: u64,
    /// Bounds the post-open liveness check.
    pub ping_timeout_ms: u64,
    /// Bounds waiting for checked-out connections on close.
    pub disconnect_timeout_ms: u64,
    /// Bounds creating the document backend's indexes.
    pub index_timeout_ms: u64,
    /// Lock wait applied to every pooled connection.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Relational,
            database_path: PathBuf::from("kinstore.db"),
            pool_size: 4,
            connect_timeout_ms: 10_000,
            ping_timeout_ms: 2_000,
            disconnect_timeout_ms: 5_000,
            index_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn new(backend: Backend, database_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            database_path: database_path.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON config; missing fields take defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if self.pool_size < MIN_POOL_SIZE {
            return Err(ConfigError::PoolTooSmall {
                pool_size: self.pool_size,
                minimum: MIN_POOL_SIZE,
            });
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("index_timeout_ms", self.index_timeout_ms),
            ("busy_timeout_ms", self.busy_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, ConfigError, StoreConfig};

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config =
            StoreConfig::from_json_str(r#"{"backend":"document","database_path":"/tmp/k.db"}"#)
                .unwrap();
        assert_eq!(config.backend, Backend::Document);
        assert_eq!(config.pool_size, StoreConfig::default().pool_size);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn validate_rejects_small_pool_and_zero_timeouts() {
        let mut config = StoreConfig::new(Backend::Relational, "/tmp/k.db");
        config.pool_size = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PoolTooSmall { pool_size: 1, .. })
        ));

        config.pool_size = 4;
        config.ping_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("ping_timeout_ms"))
        ));
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("Mongo".parse::<Backend>().unwrap(), Backend::Document);
        assert_eq!("sql".parse::<Backend>().unwrap(), Backend::Relational);
        assert!("redis".parse::<Backend>().is_err());
    }
}
