use serde::{Deserialize, Serialize};

use tagstore_redis::ConnectionSettings;

use crate::cache::CacheSettings;
use crate::mutex::MutexSettings;
use crate::pubsub::PubSubSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("logging setup error: {0}")]
    Logging(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub pubsub: PubSubSettings,
    #[serde(default)]
    pub mutex: MutexSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, endpoint) in [
            ("redis.read_write", &self.redis.read_write),
            ("redis.read_only", &self.redis.read_only),
        ] {
            if endpoint.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.url must not be empty")));
            }
            if endpoint.connect_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.connect_timeout_ms must be > 0"
                )));
            }
        }
        if self.pubsub.handler_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pubsub.handler_timeout_ms must be > 0".into(),
            ));
        }
        if self.mutex.default_ttl_ms == 0 {
            return Err(ConfigError::Invalid("mutex.default_ttl_ms must be > 0".into()));
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Endpoints of the write path and the replica path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub read_write: ConnectionSettings,
    #[serde(default)]
    pub read_only: ConnectionSettings,
    /// Whether the pub/sub dispatcher is started by the bootstrap.
    #[serde(default)]
    pub enable_pubsub: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "tagstore.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TAGSTORE__REDIS__READ_WRITE__URL=redis://primary:6379
        builder = builder.add_source(
            Environment::with_prefix("TAGSTORE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, ConfigError> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.redis.read_write.url, "redis://localhost:6379");
        assert!(!cfg.redis.enable_pubsub);
        assert_eq!(cfg.mutex.retry_interval_ms, 50);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut cfg = AppConfig::default();
        cfg.redis.read_only.url = "  ".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("redis.read_only.url"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cfg = AppConfig::default();
        cfg.redis.read_write.connect_timeout_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());
    }
}
