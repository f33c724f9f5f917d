//! Panel configuration.
//!
//! Sources, lowest to highest precedence:
//! 1. built-in defaults
//! 2. JSON file (`$DISPATCH_PANEL_CONFIG`, else `<config dir>/config.json`)
//! 3. environment overrides (`DISPATCH_PANEL_URL`, `DISPATCH_PANEL_POLL_SECS`,
//!    `DISPATCH_PANEL_ACTIVE_FILTER`)
//!
//! A missing file is normal. A file that exists but does not parse is an
//! error so a typo never silently falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::api::normalize_backend_url;
use crate::chime;
use crate::detector::ChangeDetection;
use crate::projector::ActiveFilter;
use crate::panel::PanelOptions;

pub const ENV_CONFIG_PATH: &str = "DISPATCH_PANEL_CONFIG";
pub const ENV_BACKEND_URL: &str = "DISPATCH_PANEL_URL";
pub const ENV_POLL_SECS: &str = "DISPATCH_PANEL_POLL_SECS";
pub const ENV_ACTIVE_FILTER: &str = "DISPATCH_PANEL_ACTIVE_FILTER";

/// Lower bound on the poll period so a bad value cannot hammer the backend.
const MIN_POLL_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelConfig {
    pub backend_url: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub active_filter: ActiveFilter,
    pub change_detection: ChangeDetection,
    pub sound_path: PathBuf,
    /// `None` uses the platform player; an empty string means terminal bell.
    pub sound_player: Option<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5000".to_string(),
            poll_interval_secs: 10,
            request_timeout_secs: 15,
            active_filter: ActiveFilter::AcceptedOnly,
            change_detection: ChangeDetection::Count,
            sound_path: PathBuf::from("notification.mp3"),
            sound_player: None,
        }
    }
}

impl PanelConfig {
    /// Load from the default locations and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.json"));
        Self::load_from(&path, |key| std::env::var(key).ok())
    }

    /// Load from `path` (missing is fine) and apply overrides from `env`.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => {
                info!(path = %path.display(), "Loaded panel config");
                serde_json::from_str::<PanelConfig>(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PanelConfig::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_env(env)?;
        config.backend_url = normalize_backend_url(&config.backend_url);
        config.poll_interval_secs = config.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS);
        config.request_timeout_secs = config.request_timeout_secs.max(1);
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = env(ENV_BACKEND_URL).filter(|u| !u.trim().is_empty()) {
            self.backend_url = url;
        }
        if let Some(raw) = env(ENV_POLL_SECS) {
            self.poll_interval_secs =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_POLL_SECS,
                        value: raw.clone(),
                    })?;
        }
        if let Some(raw) = env(ENV_ACTIVE_FILTER) {
            self.active_filter =
                ActiveFilter::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: ENV_ACTIVE_FILTER,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    pub fn panel_options(&self) -> PanelOptions {
        PanelOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            active_filter: self.active_filter,
            change_detection: self.change_detection,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn player_command(&self) -> &str {
        self.sound_player
            .as_deref()
            .unwrap_or(chime::default_player_command())
    }
}

/// Per-user config directory for the panel.
pub fn config_dir() -> PathBuf {
    let base = std::env::var("APPDATA")
        .or_else(|_| std::env::var("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into())).join(".config")
        });
    base.join("dispatch-panel")
}
