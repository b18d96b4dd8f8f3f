use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::Config;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/taskmux/config.toml` on Linux, or the platform
    /// equivalent via `dirs::config_dir()`. Falls back to the current
    /// directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("taskmux").join("config.toml")
    }

    /// Loads configuration from the default config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`.
    ///
    /// - If the file doesn't exist, returns `Config::default()`.
    /// - If the file exists, parses it as TOML and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Checks:
    /// - Terminal dimensions are non-zero
    /// - Scrollback and event queues can hold at least one item
    /// - The restart backoff cap is not below its starting interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Terminal size must be non-zero, got {}x{}",
                    self.terminal.rows, self.terminal.cols
                ),
            });
        }

        if self.scrollback.capacity_bytes == 0 {
            return Err(ConfigError::ValidationError {
                message: "scrollback.capacity_bytes must be greater than zero".to_string(),
            });
        }

        if self.supervisor.event_queue_capacity == 0 {
            return Err(ConfigError::ValidationError {
                message: "supervisor.event_queue_capacity must be greater than zero".to_string(),
            });
        }

        if self.restart.max_backoff_ms < self.restart.min_interval_ms {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "restart.max_backoff_ms ({}) is below restart.min_interval_ms ({})",
                    self.restart.max_backoff_ms, self.restart.min_interval_ms
                ),
            });
        }

        Ok(())
    }

    /// Task store location, configured or under the platform data dir.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir().join("tasks.json"))
    }

    /// Directory for mirrored scrollback, when persistence is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        if !self.scrollback.persist {
            return None;
        }
        Some(
            self.scrollback
                .log_dir
                .clone()
                .unwrap_or_else(|| data_dir().join("logs")),
        )
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskmux")
}
