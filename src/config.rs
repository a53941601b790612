//! Configuration management for Tollgate.
//!
//! Settings are layered with the `config` crate: built-in defaults, an optional
//! YAML file, `TOLLGATE__*` environment overrides and finally the plain
//! `REDIS_URL` variable for the distributed store connection string.

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::store::RedisConfig;

/// Environment variable holding the distributed store connection string.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Prefix for structured environment overrides, e.g. `TOLLGATE__STORE__KEY_PREFIX`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Path to a YAML policy catalog overriding the built-in policies
    #[serde(default)]
    pub policies_path: Option<PathBuf>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection string; `None` means memory-only limiting
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on establishing a Redis connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single Redis operation
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// How often the memory store purges expired windows
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_operation_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl StoreConfig {
    /// Redis settings, if a connection string is configured.
    pub fn redis(&self) -> Option<RedisConfig> {
        let url = self.redis_url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        Some(RedisConfig {
            url: url.to_string(),
            key_prefix: self.key_prefix.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        })
    }

    /// Interval between memory store sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            let name = path
                .to_str()
                .ok_or_else(|| TollgateError::Config(format!("non UTF-8 path: {}", path.display())))?;
            builder = builder.add_source(File::new(name, FileFormat::Yaml).required(true));
        }
        Self::finish(builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
    }

    /// Load configuration from a YAML string, without consulting the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let redis_url = std::env::var(REDIS_URL_ENV).ok().filter(|u| !u.trim().is_empty());
        let config = builder
            .set_override_option("store.redis_url", redis_url)?
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert!(config.store.redis_url.is_none());
        assert!(config.store.redis().is_none());
        assert_eq!(config.store.key_prefix, "ratelimit:");
        assert_eq!(config.store.operation_timeout_ms, 250);
        assert_eq!(config.store.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  redis_url: redis://cache.internal:6379/2
  operation_timeout_ms: 100
policies_path: /etc/tollgate/policies.yaml
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        let redis = config.store.redis().unwrap();
        assert_eq!(redis.url, "redis://cache.internal:6379/2");
        assert_eq!(redis.operation_timeout, Duration::from_millis(100));
        assert_eq!(redis.connect_timeout, Duration::from_millis(1000));
        assert_eq!(redis.key_prefix, "ratelimit:");
        assert_eq!(
            config.policies_path.as_deref(),
            Some(Path::new("/etc/tollgate/policies.yaml"))
        );
    }

    #[test]
    fn test_blank_redis_url_means_memory_only() {
        let yaml = r#"
store:
  redis_url: "  "
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert!(config.store.redis().is_none());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let result = TollgateConfig::load(Some(Path::new("/nonexistent/tollgate.yaml")));
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }
}
