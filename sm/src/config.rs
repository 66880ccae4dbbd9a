//! StatMon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dispatch::DispatchConfig;

/// Main StatMon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher timing
    pub dispatch: DispatchConfig,

    /// Upstream monitor subscription
    pub monitor: MonitorConfig,

    /// Status printers registered by `sm run`
    pub watches: Vec<WatchConfig>,

    /// Register the built-in focus/instrument change watch
    #[serde(rename = "config-watch")]
    pub config_watch: bool,

    /// Log level; overridden by --log-level
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            monitor: MonitorConfig::default(),
            watches: Vec::new(),
            config_watch: true,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed here; the full load reports them.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::candidates().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    /// Project-local config, then user config
    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("statmon.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("statmon").join("statmon.yml"));
        }
        paths
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Upstream monitor subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Channels to subscribe to on the monitor
    pub channels: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channels: vec!["status".to_string()],
        }
    }
}

/// One status printer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub id: String,
    pub keys: Vec<String>,
}
