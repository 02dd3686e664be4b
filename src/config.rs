// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for nativedl.
//!
//! Settings live in `~/.nativedl/config.json`. Every field is optional and
//! falls back to a default, so a missing file is a valid configuration. The
//! base directory can be moved with the `NATIVEDL_HOME` environment variable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the base directory.
pub const HOME_ENV: &str = "NATIVEDL_HOME";

/// Default connect timeout, matching the mobile transports.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default stall timeout between body chunks.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default number of terminal records kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 64;

/// Options the queue core itself consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Base for relative destination directories
    pub download_root: Option<PathBuf>,
    /// Bound on the terminal-record history
    pub history_limit: usize,
    /// Auto-advance also picks never-started `Waiting` tasks
    pub promote_waiting: bool,
    /// Run admission control already at `add`
    pub check_space_on_add: bool,
    /// Delete leftover part files when opening
    pub clean_partial_on_open: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            download_root: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            promote_waiting: true,
            check_space_on_add: false,
            clean_partial_on_open: true,
        }
    }
}

/// Persisted user configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloaderConfig {
    /// Where the registry is stored (defaults to the base directory)
    pub state_dir: Option<PathBuf>,
    /// Base for relative destination directories
    pub download_root: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub event_capacity: Option<usize>,
    pub history_limit: Option<usize>,
    pub promote_waiting: Option<bool>,
    pub check_space_on_add: Option<bool>,
    pub clean_partial_on_open: Option<bool>,
    pub user_agent: Option<String>,
}

impl DownloaderConfig {
    /// Settings for the queue core.
    pub fn queue_options(&self) -> QueueOptions {
        let defaults = QueueOptions::default();
        QueueOptions {
            download_root: self.download_root.clone(),
            history_limit: self.history_limit.unwrap_or(defaults.history_limit),
            promote_waiting: self.promote_waiting.unwrap_or(defaults.promote_waiting),
            check_space_on_add: self.check_space_on_add.unwrap_or(defaults.check_space_on_add),
            clean_partial_on_open: self.clean_partial_on_open.unwrap_or(defaults.clean_partial_on_open),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS))
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY)
    }

    /// Directory holding `state.json`.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_config_dir(),
        }
    }

    /// Set a field from its name and a string value, as `nativedl config set` does.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "state_dir" => self.state_dir = Some(PathBuf::from(value)),
            "download_root" => self.download_root = Some(PathBuf::from(value)),
            "connect_timeout_secs" => self.connect_timeout_secs = Some(parse(key, value)?),
            "read_timeout_secs" => self.read_timeout_secs = Some(parse(key, value)?),
            "event_capacity" => self.event_capacity = Some(parse(key, value)?),
            "history_limit" => self.history_limit = Some(parse(key, value)?),
            "promote_waiting" => self.promote_waiting = Some(parse(key, value)?),
            "check_space_on_add" => self.check_space_on_add = Some(parse(key, value)?),
            "clean_partial_on_open" => self.clean_partial_on_open = Some(parse(key, value)?),
            "user_agent" => self.user_agent = Some(value.to_string()),
            other => bail!("Unknown config key '{}'", other),
        }
        Ok(())
    }

    /// Load from `<dir>/config.json`, or defaults if the file is absent.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))
    }

    /// Save to `<dir>/config.json`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join("config.json"), content)?;
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}

/// Base directory: `$NATIVEDL_HOME`, else `~/.nativedl`. Created if missing.
pub fn get_config_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .context("Could not find home directory")?
            .join(".nativedl"),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Load the user configuration from the base directory.
pub fn load_config() -> Result<DownloaderConfig> {
    DownloaderConfig::load_from(&get_config_dir()?)
}

/// Save the user configuration to the base directory.
pub fn save_config(config: &DownloaderConfig) -> Result<()> {
    config.save_to(&get_config_dir()?)
}
