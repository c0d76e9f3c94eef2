//! YAML configuration.
//!
//! Loaded from `$HEARTH_CONFIG` (default `hearth.yaml`). A missing file means
//! defaults; `HEARTH_HTTP_PORT` and `HEARTH_DB_PATH` override the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_HTTP_PORT: u16 = 8124;
pub const DEFAULT_DB_PATH: &str = "hearth.db";
pub const DEFAULT_AUTOMATIONS_PATH: &str = "automations.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct HearthConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Automation list; skipped when the file does not exist.
    #[serde(default = "default_automations_path")]
    pub automations: PathBuf,
    #[serde(default)]
    pub nmap_tracker: Vec<crate::integrations::nmap_tracker::NmapEntryConfig>,
    #[serde(default)]
    pub ombi: Option<crate::integrations::ombi::OmbiConfig>,
    #[serde(default)]
    pub zwave: Option<ZwaveConfig>,
}

/// Z-Wave node snapshot to load at startup (as dumped by the Z-Wave server).
#[derive(Debug, Clone, Deserialize)]
pub struct ZwaveConfig {
    pub nodes_file: PathBuf,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_automations_path() -> PathBuf {
    PathBuf::from(DEFAULT_AUTOMATIONS_PATH)
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            db_path: default_db_path(),
            automations: default_automations_path(),
            nmap_tracker: Vec::new(),
            ombi: None,
            zwave: None,
        }
    }
}

impl HearthConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: HearthConfig = serde_yaml::from_str(contents)?;
        for entry in &config.nmap_tracker {
            entry.validate()?;
        }
        Ok(config)
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("HEARTH_HTTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.http_port = port;
        }
        if let Ok(db) = std::env::var("HEARTH_DB_PATH") {
            self.db_path = PathBuf::from(db);
        }
    }
}

/// Split a comma-separated list, trimming items and dropping empty ones.
pub fn ensure_list_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}
