//! Configuration loading for the `fleetsync` watcher.
//!
//! The backend section and at least one resource are required. Sync tuning
//! and logging fall back to library defaults.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fleetsync_backend::BackendConfig;
use fleetsync_core::{ResourceKey, SelectQuery, SyncConfig};
use fleetsync_realtime::RealtimeMode;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "FLEETSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Emit JSON log lines instead of the human format.
    #[serde(default)]
    pub json: bool,
    /// Default filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "fleetsync=info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_filter(),
        }
    }
}

/// One resource to register and watch.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub key: ResourceKey,
    pub query: SelectQuery,
    #[serde(default)]
    pub realtime: RealtimeMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or {CONFIG_ENV})")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<fleetsync_core::ConfigError> for ConfigError {
    fn from(err: fleetsync_core::ConfigError) -> Self {
        match err {
            fleetsync_core::ConfigError::MissingRequired { field } => ConfigError::InvalidValue {
                field,
                reason: "is required".to_string(),
            },
            fleetsync_core::ConfigError::InvalidValue { field, reason, .. } => {
                ConfigError::InvalidValue { field, reason }
            }
        }
    }
}

impl CliConfig {
    /// Load from `--config <path>` or `FLEETSYNC_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args(std::env::args().skip(1)).or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;
        self.sync.validate()?;
        if self.log.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log.filter".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.resources.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "resources".to_string(),
                reason: "at least one resource must be configured".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(&resource.key) {
                return Err(ConfigError::InvalidValue {
                    field: "resources.key".to_string(),
                    reason: format!("duplicate key '{}'", resource.key),
                });
            }
            if resource.query.id_field.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("resources.{}.query.id_field", resource.key),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

/// Value following `--config`, if any.
pub fn config_path_from_args<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
