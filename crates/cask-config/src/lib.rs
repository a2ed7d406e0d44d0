//! # cask-config
//!
//! Configuration management for Cask.
//!
//! Loads configuration from:
//! 1. `~/.cask/config.toml` (global)
//! 2. `.cask/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use logging::{init_logging, LogLevel};

/// Environment override for `container.path`
pub const CONTAINER_ENV: &str = "CASK_CONTAINER";
/// Environment override for `logging.level`
pub const LOG_LEVEL_ENV: &str = "CASK_LOG_LEVEL";
/// Environment override for `store.write_through`
pub const WRITE_THROUGH_ENV: &str = "CASK_WRITE_THROUGH";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|err| {
        warn!(error = %err, "Falling back to default config");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub container: ContainerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Self::project_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(project))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load and layer config files, skipping any that do not exist.
    ///
    /// Later files override earlier ones per key, so a project file only
    /// needs to name the settings it changes.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Loading config");
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.cask/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cask/config.toml"))
    }

    /// Project config path, relative to the working directory
    pub fn project_config_path() -> &'static Path {
        Path::new(".cask/config.toml")
    }

    /// Apply environment variable overrides read through `lookup`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(CONTAINER_ENV) {
            self.container.path = PathBuf::from(path);
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            match level.parse() {
                Ok(level) => self.logging.level = level,
                Err(err) => warn!(var = LOG_LEVEL_ENV, error = %err, "Ignoring override"),
            }
        }
        if let Some(flag) = lookup(WRITE_THROUGH_ENV) {
            match parse_bool(&flag) {
                Some(flag) => self.store.write_through = flag,
                None => warn!(var = WRITE_THROUGH_ENV, value = %flag, "Ignoring override"),
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Recursively overlay `overlay` onto `base`; nested tables merge, other
/// values replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Container location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container file used when the CLI gets no `--container`
    pub path: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data.cask"),
        }
    }
}

/// Block store behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Flush the header after every write and append
    pub write_through: bool,
    /// Compact the container when it is closed
    pub defragment_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_through: true,
            defragment_on_close: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
