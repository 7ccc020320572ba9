//! Indicator Configuration
//!
//! Stored as TOML in `$XDG_CONFIG_HOME/phone-indicator/config.toml`.
//!
//! ```toml
//! backend = "kdeconnect"
//! start_daemon = true
//! per_device = true
//!
//! [display]
//! show_unpaired = true
//! show_unallowed = true
//! show_inactive = true
//! ```

use anyhow::{Context, Result};
use device_bridge::{BackendKind, VisibilityFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Indicator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Device bridge backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Launch the backend daemon when it is not running
    #[serde(default = "default_true")]
    pub start_daemon: bool,

    /// One line per device while watching, instead of a combined line
    #[serde(default = "default_true")]
    pub per_device: bool,

    /// Which devices are listed
    #[serde(default)]
    pub display: VisibilityFilter,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            start_daemon: true,
            per_device: true,
            display: VisibilityFilter::default(),
        }
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("phone-indicator")
            .join("config.toml")
    }

    /// Load configuration from file, creating default if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!("Created default configuration at {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }
}
