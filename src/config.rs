//! Server configuration from environment variables (and `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::SyncServerConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_path: String,
    /// Optional JSON file replacing the built-in problem catalog
    pub catalog_path: Option<PathBuf>,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub compaction_threshold: usize,
    pub max_participants_per_session: usize,
    pub max_sessions: usize,
    pub end_session_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage_path: "./data/classroom.sled".to_string(),
            catalog_path: None,
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            compaction_threshold: 200,
            max_participants_per_session: 60,
            max_sessions: 500,
            end_session_grace: Duration::from_millis(2000),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

impl ServerConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; missing keys fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            port: parse("PORT", get("PORT"), defaults.port)?,
            storage_path: get("STORAGE_PATH").unwrap_or(defaults.storage_path),
            catalog_path: get("CATALOG_PATH").map(PathBuf::from),
            heartbeat_timeout: Duration::from_secs(parse(
                "HEARTBEAT_TIMEOUT_SECS",
                get("HEARTBEAT_TIMEOUT_SECS"),
                defaults.heartbeat_timeout.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse(
                "SWEEP_INTERVAL_SECS",
                get("SWEEP_INTERVAL_SECS"),
                defaults.sweep_interval.as_secs(),
            )?),
            compaction_threshold: parse(
                "COMPACTION_THRESHOLD",
                get("COMPACTION_THRESHOLD"),
                defaults.compaction_threshold,
            )?,
            max_participants_per_session: parse(
                "MAX_PARTICIPANTS_PER_SESSION",
                get("MAX_PARTICIPANTS_PER_SESSION"),
                defaults.max_participants_per_session,
            )?,
            max_sessions: parse("MAX_SESSIONS", get("MAX_SESSIONS"), defaults.max_sessions)?,
            end_session_grace: Duration::from_millis(parse(
                "END_SESSION_GRACE_MS",
                get("END_SESSION_GRACE_MS"),
                defaults.end_session_grace.as_millis() as u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("SWEEP_INTERVAL_SECS must be positive".to_string()));
        }
        if self.heartbeat_timeout < self.sweep_interval {
            return Err(ConfigError::Invalid(
                "HEARTBEAT_TIMEOUT_SECS must not be shorter than SWEEP_INTERVAL_SECS".to_string(),
            ));
        }
        if self.max_participants_per_session == 0 || self.max_sessions == 0 {
            return Err(ConfigError::Invalid("session limits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_end_session_grace(mut self, grace: Duration) -> Self {
        self.end_session_grace = grace;
        self
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig::new(self.storage_path.clone())
    }

    pub fn sync_server(&self) -> SyncServerConfig {
        SyncServerConfig::default()
            .with_heartbeat_timeout(self.heartbeat_timeout)
            .with_sweep_interval(self.sweep_interval)
            .with_compaction_threshold(self.compaction_threshold)
            .with_max_participants(self.max_participants_per_session)
            .with_max_sessions(self.max_sessions)
            .with_end_session_grace(self.end_session_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_path, "./data/classroom.sled");
        assert!(config.catalog_path.is_none());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.end_session_grace, Duration::from_millis(2000));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("CATALOG_PATH", "/etc/classroom/problems.json"),
            ("COMPACTION_THRESHOLD", " 50 "),
            ("END_SESSION_GRACE_MS", "0"),
            ("MAX_SESSIONS", ""),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.compaction_threshold, 50);
        assert_eq!(config.max_sessions, 500);
        assert_eq!(
            config.catalog_path,
            Some(PathBuf::from("/etc/classroom/problems.json"))
        );

        let sync = config.sync_server();
        assert_eq!(sync.compaction_threshold, 50);
        assert!(sync.end_session_grace.is_zero());
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PORT".to_string(),
                value: "eighty".to_string()
            }
        );
        assert!(ServerConfig::from_lookup(lookup(&[("HEARTBEAT_TIMEOUT_SECS", "-1")])).is_err());
    }

    #[test]
    fn test_timeout_shorter_than_sweep_is_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[
            ("HEARTBEAT_TIMEOUT_SECS", "2"),
            ("SWEEP_INTERVAL_SECS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
