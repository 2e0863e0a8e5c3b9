//! The `Config` struct plus persistence and validation.
//!
//! Covers:
//! - `load` / `save` (YAML file I/O with atomic write)
//! - XDG-style path helpers (`config_dir`, `config_path`)
//! - `validate` for the engine's numeric limits

use crate::defaults;
use crate::error::ConfigError;
use crate::types::{ClientSize, LogLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accepted range for `refresh_debounce_ms`.
pub const DEBOUNCE_RANGE_MS: std::ops::RangeInclusive<u64> = 10..=1_000;

/// Engine configuration, stored as `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path to the tmux binary
    #[serde(default = "defaults::tmux_path")]
    pub tmux_path: String,

    /// Per-pane replay buffer cap in bytes
    #[serde(default = "defaults::output_buffer_limit")]
    pub output_buffer_limit: usize,

    /// Quiet period before a burst of topology notifications triggers a refresh
    #[serde(default = "defaults::refresh_debounce_ms")]
    pub refresh_debounce_ms: u64,

    /// How long an awaited control-mode command may stay unanswered
    #[serde(default = "defaults::command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Seconds of backlog before tmux pauses a pane (`pause-after`); 0 disables
    #[serde(default = "defaults::pause_after_secs")]
    pub pause_after_secs: u32,

    /// Scrollback lines kept by tmux for each pane of a workspace session
    #[serde(default = "defaults::history_limit")]
    pub history_limit: u32,

    /// Control client size; tmux picks its default when unset
    #[serde(default)]
    pub client_size: Option<ClientSize>,

    /// tmux `pane-border-style` for workspace sessions; empty keeps tmux's own
    #[serde(default = "defaults::pane_border_style")]
    pub pane_border_style: String,

    /// tmux `pane-active-border-style`; empty keeps tmux's own
    #[serde(default = "defaults::pane_active_border_style")]
    pub pane_active_border_style: String,

    /// Fallback session name when a workspace name sanitizes to nothing
    #[serde(default = "defaults::session_prefix")]
    pub session_prefix: String,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_path: defaults::tmux_path(),
            output_buffer_limit: defaults::output_buffer_limit(),
            refresh_debounce_ms: defaults::refresh_debounce_ms(),
            command_timeout_ms: defaults::command_timeout_ms(),
            pause_after_secs: defaults::pause_after_secs(),
            history_limit: defaults::history_limit(),
            client_size: None,
            pane_border_style: defaults::pane_border_style(),
            pane_active_border_style: defaults::pane_active_border_style(),
            session_prefix: defaults::session_prefix(),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists yet.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        log::info!("Config path: {:?}", config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            log::info!("Config file not found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        log::info!("Loading config from {:?}", path);
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml_ng::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml_ng::to_string(self)?;

        // Atomic save: write to temp file then rename to prevent corruption on crash
        let temp_path = path.with_extension("yaml.tmp");
        fs::write(&temp_path, &yaml)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Directory holding `config.yaml` (`~/.config/devhaven` on Unix).
    pub fn config_dir() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            dirs::config_dir()
                .map(|dir| dir.join("devhaven"))
                .unwrap_or_else(|| PathBuf::from("."))
        }
        #[cfg(not(target_os = "windows"))]
        {
            dirs::home_dir()
                .map(|home| home.join(".config").join("devhaven"))
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.yaml")
    }

    /// Check numeric limits the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_buffer_limit == 0 {
            return Err(ConfigError::Validation(
                "output_buffer_limit must be greater than 0".to_string(),
            ));
        }
        if !DEBOUNCE_RANGE_MS.contains(&self.refresh_debounce_ms) {
            return Err(ConfigError::Validation(format!(
                "refresh_debounce_ms must be within {}..={} (got {})",
                DEBOUNCE_RANGE_MS.start(),
                DEBOUNCE_RANGE_MS.end(),
                self.refresh_debounce_ms
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.tmux_path.trim().is_empty() {
            return Err(ConfigError::Validation("tmux_path is empty".to_string()));
        }
        if let Some(size) = self.client_size
            && (size.cols == 0 || size.rows == 0)
        {
            return Err(ConfigError::Validation(format!(
                "client_size must be non-zero (got {}x{})",
                size.cols, size.rows
            )));
        }
        Ok(())
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
