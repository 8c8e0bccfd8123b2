//! Configuration management for the collector
//!
//! Handles loading and validation of `airlab.toml` files. Every section and
//! field is optional; missing values take the defaults below. The CLI layers
//! flag and environment overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker connection settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Collection episode settings
    #[serde(default)]
    pub collect: CollectConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// Empty means anonymous.
    pub username: String,
    pub password: String,
    /// Root of the sensor's channel tree; the episode subscribes to `<base>/#`.
    pub base_topic: String,
    /// Client id prefix; the process id is appended.
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            base_topic: "airlab".to_string(),
            client_id_prefix: "airlab-collector".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl BusConfig {
    /// Wildcard pattern covering the whole base channel tree.
    #[must_use]
    pub fn subscribe_pattern(&self) -> String {
        format!("{}/#", self.base_topic.trim_end_matches('/'))
    }

    #[must_use]
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, std::process::id())
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// SQLite busy handler wait before a write reports contention.
    pub busy_timeout_ms: u64,
    /// Total insert attempts under contention.
    pub max_write_attempts: u32,
    /// Linear backoff step between attempts.
    pub retry_step_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("airlab.db"),
            busy_timeout_ms: 10_000,
            max_write_attempts: 3,
            retry_step_ms: 500,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            Duration::from_millis(self.retry_step_ms),
            self.max_write_attempts,
        )
    }
}

/// Collection episode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Overall deadline for the episode.
    pub timeout_secs: u64,
    /// Extra time after the first accepted message.
    pub collect_window_secs: u64,
    /// Channels ending in this suffix carry discovery metadata, not data.
    pub discovery_suffix: String,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            collect_window_secs: 3,
            discovery_suffix: "/config".to_string(),
        }
    }
}

impl CollectConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn collect_window(&self) -> Duration {
        Duration::from_secs(self.collect_window_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid(format!("unknown log format: {other}"))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error. `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Ok(Self::from_toml(&content)?)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Reject values that would make an episode meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.host.trim().is_empty() {
            return Err(ConfigError::Invalid("bus.host must not be empty".into()));
        }
        if self.bus.port == 0 {
            return Err(ConfigError::Invalid("bus.port must be non-zero".into()));
        }
        if self.bus.base_topic.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("bus.base_topic must not be empty".into()));
        }
        if self.bus.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "bus.connect_timeout_secs must be at least 1".into(),
            ));
        }
        if self.collect.timeout_secs == 0 {
            return Err(ConfigError::Invalid("collect.timeout_secs must be at least 1".into()));
        }
        if self.storage.max_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_write_attempts must be at least 1".into(),
            ));
        }
        if self.storage.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.db_path must not be empty".into()));
        }
        if self.collect.collect_window_secs >= self.collect.timeout_secs {
            tracing::warn!(
                collect_window_secs = self.collect.collect_window_secs,
                timeout_secs = self.collect.timeout_secs,
                "Collection window reaches past the overall timeout; episodes will end on the timeout"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.host, "localhost");
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.bus.subscribe_pattern(), "airlab/#");
        assert_eq!(config.collect.timeout(), Duration::from_secs(30));
        assert_eq!(config.collect.collect_window(), Duration::from_secs(3));
        assert_eq!(config.collect.discovery_suffix, "/config");
        assert_eq!(config.storage.max_write_attempts, 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [bus]
            host = "broker.lan"
            base_topic = "office/airlab"

            [collect]
            timeout_secs = 45

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.bus.host, "broker.lan");
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.bus.subscribe_pattern(), "office/airlab/#");
        assert_eq!(config.collect.timeout_secs, 45);
        assert_eq!(config.collect.collect_window_secs, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storage.db_path, PathBuf::from("airlab.db"));
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let err = Config::from_toml("[bus\nhost = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let err = Config::load_from(Path::new("/nonexistent/airlab.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ReadFailed(_, _))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("airlab.toml");
        std::fs::write(&path, "[storage]\ndb_path = \"/var/lib/airlab/airlab.db\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(
            config.storage.db_path,
            PathBuf::from("/var/lib/airlab/airlab.db")
        );
    }

    #[test]
    fn validate_rejects_zero_timeout_and_empty_topic() {
        let mut config = Config::default();
        config.collect.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.base_topic = "/".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.max_write_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_retry_policy_matches_settings() {
        let policy = StorageConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    }

    #[test]
    fn credentials_and_client_id() {
        let mut bus = BusConfig::default();
        assert!(!bus.has_credentials());
        bus.username = "sensor".into();
        assert!(bus.has_credentials());
        assert!(bus.client_id().starts_with("airlab-collector-"));
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
