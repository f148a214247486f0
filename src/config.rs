use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use scrawl_core::SyncConfig;

/// Application configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding cached notes and the offline queue.
    pub data_dir: PathBuf,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync engine configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing the config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut data_dir = Self::default_data_dir();
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against the config file's directory
                data_dir = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Environment variable overrides
        if let Ok(dir) = std::env::var("SCRAWL_DATA_DIR") {
            data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("SCRAWL_SYNC_URL") {
            sync.server_url = Some(url);
        }

        Ok(Self {
            data_dir,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/scrawl/
    /// - macOS: ~/Library/Application Support/scrawl/
    /// - Windows: %APPDATA%/scrawl/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrawl")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/scrawl/
    /// - macOS: ~/Library/Application Support/scrawl/
    /// - Windows: %APPDATA%/scrawl/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrawl")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
