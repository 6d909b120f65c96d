//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/adoptrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/adoptrack/` (~/.config/adoptrack/)
//! - Data: `$XDG_DATA_HOME/adoptrack/` (~/.local/share/adoptrack/)
//! - State/Logs: `$XDG_STATE_HOME/adoptrack/` (~/.local/state/adoptrack/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the database location.
pub const DB_PATH_ENV: &str = "ADOPTRACK_DB_PATH";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Storage location overrides
    #[serde(default)]
    pub storage: StorageConfig,

    /// Line differ limits
    #[serde(default)]
    pub diff: DiffConfig,

    /// Project resolution
    #[serde(default)]
    pub projects: ProjectsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    /// Database file path; defaults to the XDG data directory
    pub database_path: Option<PathBuf>,
}

/// Line differ configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiffConfig {
    /// Largest side (in lines) the differ will align before degrading
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
        }
    }
}

fn default_max_lines() -> usize {
    5000
}

/// Project resolution configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ProjectsConfig {
    /// Known project roots. A file belongs to the longest root that prefixes it.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Log directory; defaults to the XDG state directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.diff.max_lines == 0 {
            return Err(Error::Config(
                "diff.max_lines must be greater than zero".to_string(),
            ));
        }
        if self
            .projects
            .roots
            .iter()
            .any(|root| root.as_os_str().is_empty())
        {
            return Err(Error::Config(
                "projects.roots must not contain empty paths".to_string(),
            ));
        }
        Ok(())
    }

    /// Database path after applying the env override and config file.
    pub fn resolved_database_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/adoptrack/config.toml` (~/.config/adoptrack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("adoptrack").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/adoptrack/` (~/.local/share/adoptrack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("adoptrack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/adoptrack/` (~/.local/state/adoptrack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("adoptrack")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/adoptrack/data.db` (~/.local/share/adoptrack/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }
}
