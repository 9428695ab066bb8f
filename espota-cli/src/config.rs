//! Configuration file support for espota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ESPOTA_*)
//! 3. Local config file (./espota.toml)
//! 4. Global config file (~/.config/espota/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ProgressMode;

/// Device connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device address (IP or hostname).
    pub address: Option<String>,
    /// Device OTA port.
    pub port: Option<u16>,
    /// OTA password.
    pub password: Option<String>,
}

/// Upload behaviour settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upload the filesystem image by default.
    #[serde(default)]
    pub spiffs: bool,
    /// Treat a truncated final confirmation as a failure.
    #[serde(default)]
    pub strict: bool,
    /// Progress style ("bar" or "ticks").
    pub progress: Option<String>,
    /// Per-invitation reply timeout in seconds.
    pub timeout: Option<u64>,
}

impl UploadConfig {
    /// Parse the configured progress style, ignoring unknown values.
    pub fn progress_mode(&self) -> Option<ProgressMode> {
        match self.progress.as_deref() {
            Some("bar") => Some(ProgressMode::Bar),
            Some("ticks") => Some(ProgressMode::Ticks),
            Some(other) => {
                warn!("Unknown progress style in config: {other:?}");
                None
            }
            None => None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("espota.toml")) {
            debug!("Loaded local config from espota.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "espota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Device config
        if other.device.address.is_some() {
            self.device.address = other.device.address;
        }
        if other.device.port.is_some() {
            self.device.port = other.device.port;
        }
        if other.device.password.is_some() {
            self.device.password = other.device.password;
        }

        // Upload config
        if other.upload.spiffs {
            self.upload.spiffs = true;
        }
        if other.upload.strict {
            self.upload.strict = true;
        }
        if other.upload.progress.is_some() {
            self.upload.progress = other.upload.progress;
        }
        if other.upload.timeout.is_some() {
            self.upload.timeout = other.upload.timeout;
        }
    }
}
