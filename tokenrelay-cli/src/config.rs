//! CLI configuration handling.
//!
//! ```toml
//! log_level = "info"
//! prefer_keyring = true
//!
//! [client]
//! base_url = "https://api.example.com"
//! proactive_refresh = true
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenrelay_core::ClientConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path of the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Persist tokens in the OS keyring instead of process memory.
    #[serde(default = "default_prefer_keyring")]
    pub prefer_keyring: bool,

    #[serde(default)]
    pub client: ClientConfig,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_prefer_keyring() -> bool {
    true
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            log_level: default_log_level(),
            prefer_keyring: default_prefer_keyring(),
            client: ClientConfig::default(),
        }
    }
}

/// Load configuration from `path`, or from the platform config directory.
///
/// A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path(),
    };
    load_from_path(&config_path)
}

pub fn load_from_path(config_path: &Path) -> Result<CliConfig> {
    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        CliConfig::default()
    };

    config.config_path = config_path.to_path_buf();
    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("com", "raibid-labs", "tokenrelay")
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("tokenrelay.toml"))
}
