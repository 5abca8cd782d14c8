//! Configuration loading for the strike service.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the configured broker URL.
pub const BROKER_URL_ENV: &str = "STRIKEWATCH_BROKER_URL";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables for ingestion, buffering and subscription management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrikeConfig {
    /// Broker endpoint, e.g. `mqtt://host:1883`
    pub broker_url: String,
    /// Topic prefix under which tiles are published
    pub topic_prefix: String,
    pub client_id_prefix: String,
    pub reconnect_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    /// How long strikes stay in the rolling buffer
    pub retention_minutes: u64,
    pub max_buffer_size: usize,
    pub max_subscriptions: usize,
    /// Subscriptions idle for longer than this are dropped
    pub subscription_stale_minutes: u64,
    /// Dwell between subscribing and reading the buffer
    pub settle_ms: u64,
    pub max_tile_expansion: usize,
    pub cleanup_interval_secs: u64,
    pub prune_interval_secs: u64,
    /// Tile precision used when no precision fits the subscription budget
    pub default_precision: usize,
}

impl Default for StrikeConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://blitzortung.ha.sed.pl:1883".to_string(),
            topic_prefix: "blitzortung/1.1".to_string(),
            client_id_prefix: "strikewatch".to_string(),
            reconnect_period_ms: 5_000,
            connect_timeout_ms: 10_000,
            keep_alive_secs: 30,
            retention_minutes: 120,
            max_buffer_size: 10_000,
            max_subscriptions: 9,
            subscription_stale_minutes: 60,
            settle_ms: 2_000,
            max_tile_expansion: 10_000,
            cleanup_interval_secs: 60,
            prune_interval_secs: 300,
            default_precision: 3,
        }
    }
}

impl StrikeConfig {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes * 60)
    }

    pub fn subscription_staleness(&self) -> Duration {
        Duration::from_secs(self.subscription_stale_minutes * 60)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Apply environment overrides (currently only the broker URL).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(BROKER_URL_ENV) {
            if !url.trim().is_empty() {
                log::info!("Using broker URL from {}: {}", BROKER_URL_ENV, url);
                self.broker_url = url;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_url must not be empty".into()));
        }
        if self.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("topic_prefix must not be empty".into()));
        }

        let non_zero = [
            ("reconnect_period_ms", self.reconnect_period_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("keep_alive_secs", self.keep_alive_secs),
            ("retention_minutes", self.retention_minutes),
            ("max_buffer_size", self.max_buffer_size as u64),
            ("max_subscriptions", self.max_subscriptions as u64),
            ("subscription_stale_minutes", self.subscription_stale_minutes),
            ("max_tile_expansion", self.max_tile_expansion as u64),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("prune_interval_secs", self.prune_interval_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        if !(1..=crate::geohash::MAX_PRECISION).contains(&self.default_precision) {
            return Err(ConfigError::Invalid(format!(
                "default_precision must be 1-{}, got {}",
                crate::geohash::MAX_PRECISION,
                self.default_precision
            )));
        }

        Ok(())
    }
}

/// Default config location: `~/.strikewatch/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".strikewatch")
        .join("config.yaml")
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<StrikeConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: StrikeConfig = serde_yaml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file, or use defaults if it doesn't exist.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<StrikeConfig> {
    let path = path.as_ref();

    if !path.exists() {
        log::info!("Config file not found, using defaults: {}", path.display());
        return Ok(StrikeConfig::default());
    }

    load_config(path)
}

/// Resolve the effective configuration.
///
/// Broker URL precedence: `broker` argument, then `STRIKEWATCH_BROKER_URL`,
/// then the file at `path`, then the built-in default.
pub fn resolve_config(path: impl AsRef<Path>, broker: Option<&str>) -> Result<StrikeConfig> {
    let mut config = load_config_or_default(path)?.with_env_overrides();
    if let Some(url) = broker.filter(|u| !u.trim().is_empty()) {
        log::info!("Using broker URL from command line: {}", url);
        config.broker_url = url.to_string();
    }
    config.validate()?;
    Ok(config)
}

/// Parse configuration from a YAML string.
pub fn parse_config(yaml: &str) -> Result<StrikeConfig> {
    let config: StrikeConfig =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
