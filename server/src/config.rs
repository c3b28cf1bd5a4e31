//! Configuration management for the server.

use accord_engine::{BucketConfig, ClockConfig, NodeId, SyncConfig, DEFAULT_MAX_DRIFT_MILLIS};
use std::env;
use std::str::FromStr;

/// Default idle time before a mid-cycle session is reset.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// SQLite connection URL
    pub database_url: String,
    /// Node id stamped on timestamps issued by this relay
    pub node_id: NodeId,
    pub clock: ClockConfig,
    pub sync: SyncConfig,
    /// Idle time after which an unfinished session is reset
    pub session_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let node_id = match lookup("NODE_ID") {
            Some(hex) => NodeId::from_hex(&hex).map_err(|_| ConfigError::InvalidNodeId(hex))?,
            None => random_node_id(),
        };

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            bucket: BucketConfig {
                fan_out: parse_or(&lookup, "FAN_OUT", defaults.bucket.fan_out)?,
            },
            leaf_threshold: parse_or(&lookup, "LEAF_THRESHOLD", defaults.leaf_threshold)?,
            max_depth: parse_or(&lookup, "MAX_DEPTH", defaults.max_depth)?,
        };
        if sync.bucket.fan_out == 0 {
            return Err(ConfigError::InvalidNumber {
                name: "FAN_OUT",
                value: "0".to_string(),
            });
        }

        let clock = ClockConfig {
            max_drift_millis: parse_or(&lookup, "MAX_DRIFT_MS", DEFAULT_MAX_DRIFT_MILLIS)?,
        };

        let session_timeout_ms =
            parse_or(&lookup, "SESSION_TIMEOUT_MS", DEFAULT_SESSION_TIMEOUT_MS)?;

        Ok(Self {
            host,
            port,
            database_url,
            node_id,
            clock,
            sync,
            session_timeout_ms,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}

fn random_node_id() -> NodeId {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[..8]);
    NodeId(id)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid NODE_ID value: {0} (expected 16 hex characters)")]
    InvalidNodeId(String),

    #[error("Invalid {name} value: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("DATABASE_URL", "sqlite::memory:")]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.clock, ClockConfig::default());
        assert_eq!(config.session_timeout_ms, DEFAULT_SESSION_TIMEOUT_MS);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "sqlite://accord.db"),
            ("PORT", "8080"),
            ("NODE_ID", "00112233aabbccdd"),
            ("FAN_OUT", "8"),
            ("LEAF_THRESHOLD", "4"),
            ("MAX_DEPTH", "20"),
            ("MAX_DRIFT_MS", "1000"),
            ("SESSION_TIMEOUT_MS", "500"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.node_id.to_string(), "00112233aabbccdd");
        assert_eq!(config.sync.bucket.fan_out, 8);
        assert_eq!(config.sync.leaf_threshold, 4);
        assert_eq!(config.sync.max_depth, 20);
        assert_eq!(config.clock.max_drift_millis, 1000);
        assert_eq!(config.session_timeout_ms, 500);
    }

    #[test]
    fn missing_database_url() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingDatabaseUrl)));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            load(&[("DATABASE_URL", "x"), ("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "x"), ("NODE_ID", "zz")]),
            Err(ConfigError::InvalidNodeId(_))
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "x"), ("FAN_OUT", "0")]),
            Err(ConfigError::InvalidNumber { name: "FAN_OUT", .. })
        ));
        assert!(matches!(
            load(&[("DATABASE_URL", "x"), ("MAX_DEPTH", "-1")]),
            Err(ConfigError::InvalidNumber { name: "MAX_DEPTH", .. })
        ));
    }
}
