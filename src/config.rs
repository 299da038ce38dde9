//! Engine Configuration
//!
//! File-based configuration for the server binary. TOML and YAML are
//! accepted, chosen by file extension. Every section has defaults, so an
//! empty file (or no file) runs the engine with the stock tier table and
//! an in-memory store.
//!
//! ```toml
//! [server]
//! http_bind = "0.0.0.0:8080"
//!
//! [store]
//! backend = "postgres"
//! database_url = "postgres://localhost/entitlements"
//!
//! [tiers.premium]
//! message_quota = 300
//! call_quota = 2
//! attachments_allowed = true
//! nutrition_persistent = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::limits::{LimitsError, TierLimitTable};
use crate::reset::ResetJobConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Invalid tier limits: {0}")]
    InvalidTierLimits(#[from] LimitsError),
    #[error("Invalid store configuration: {0}")]
    InvalidStore(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub reset: ResetConfig,
    pub tiers: TierLimitTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address
    pub http_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required for the postgres backend
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Bound on a single store round trip (milliseconds)
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
            timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    pub enabled: bool,
    /// Seconds between reset passes
    pub interval_secs: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
        }
    }
}

impl ResetConfig {
    pub fn job_config(&self) -> ResetJobConfig {
        ResetJobConfig {
            interval_secs: self.interval_secs,
            ..ResetJobConfig::default()
        }
    }
}

enum Format {
    Toml,
    Yaml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Toml,
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&content, Format::for_path(path)).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.validate()?;

        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                warn!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn parse(content: &str, format: Format) -> Result<Self, String> {
        match format {
            Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            Format::Yaml if content.trim().is_empty() => Ok(Self::default()),
            Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tiers.validate()?;
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigError::InvalidStore(
                "database_url is required for the postgres backend".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::InvalidStore("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::QuotaLimit;
    use crate::tier::SubscriptionTier;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let file = write_config(".toml", "");
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_toml_overrides_tier() {
        let file = write_config(
            ".toml",
            r#"
[server]
http_bind = "127.0.0.1:9000"

[tiers.premium]
message_quota = 300
call_quota = 3
attachments_allowed = true
nutrition_persistent = true
"#,
        );
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.server.http_bind, "127.0.0.1:9000");
        let premium = config.tiers.get(SubscriptionTier::Premium);
        assert_eq!(premium.message_quota, QuotaLimit::Limited(300));
        assert_eq!(premium.call_quota, 3);
        assert_eq!(config.tiers.get(SubscriptionTier::Freemium).call_quota, 1);
    }

    #[test]
    fn test_yaml_unlimited_messages() {
        let file = write_config(
            ".yaml",
            r#"
reset:
  interval_secs: 60
tiers:
  premium:
    message_quota: unlimited
    call_quota: 2
    attachments_allowed: true
    nutrition_persistent: true
"#,
        );
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.reset.interval_secs, 60);
        assert!(config.tiers.get(SubscriptionTier::Premium).message_quota.is_unlimited());
    }

    #[test]
    fn test_zero_window_rejected() {
        let file = write_config(
            ".toml",
            r#"
[tiers.freemium]
message_quota = 20
call_quota = 1
attachments_allowed = false
nutrition_window_days = 0
nutrition_persistent = false
"#,
        );
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTierLimits(_)));
    }

    #[test]
    fn test_postgres_requires_url() {
        let file = write_config(".toml", "[store]\nbackend = \"postgres\"\n");
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStore(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::load("/nonexistent/entitlements.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let file = write_config(".toml", "server = [");
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
