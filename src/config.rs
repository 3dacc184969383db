//! Layered configuration for resubmission runs.
//!
//! Configuration is read from TOML files in priority order (later files override earlier
//! ones, key by key), then environment variables are applied on top:
//!
//! 1. System: `/etc/bips/resubmit.toml`
//! 2. User: `~/.config/bips/resubmit.toml`
//! 3. Local: `bips-resubmit.toml` in the current directory
//! 4. Environment: `BIPS_TRIGGER_SOURCE`, `BIPS_BASE_DIR`, `BIPS_LOG_ROOT`, `BIPS_LOG_LEVEL`

pub mod monitor;
pub mod wrapper;

pub use monitor::{DEFAULT_AUTOMATED_SOURCE, MonitorConfig, PathsConfig};
pub use wrapper::{LoggingConfig, WrapperConfig};

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{ResubmitError, Result};

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Complete configuration of a resubmission run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResubmitConfig {
    pub monitor: MonitorConfig,
    pub paths: PathsConfig,
    pub wrapper: WrapperConfig,
    pub logging: LoggingConfig,
}

/// Locations searched for configuration files
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: Option<PathBuf>,
    pub local: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> Self {
        Self {
            system: PathBuf::from("/etc/bips/resubmit.toml"),
            user: dirs::config_dir().map(|dir| dir.join("bips").join("resubmit.toml")),
            local: PathBuf::from("bips-resubmit.toml"),
        }
    }

    /// Paths that exist on disk, lowest priority first
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.system.clone()];
        if let Some(user) = &self.user {
            paths.push(user.clone());
        }
        paths.push(self.local.clone());
        paths.into_iter().filter(|p| p.is_file()).collect()
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl ResubmitConfig {
    /// Load from the standard locations and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_with_paths(&ConfigPaths::new())?;
        config.apply_overrides(std::env::vars());
        Ok(config)
    }

    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self> {
        Self::load_from_files(&paths.existing_paths())
    }

    /// Load and merge the given files; keys in later files win
    pub fn load_from_files(files: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();
        for file in files {
            debug!("Loading configuration file={}", file.display());
            let content = fs::read_to_string(file).map_err(|e| ResubmitError::io(file, e))?;
            let table: toml::Table = toml::from_str(&content)
                .map_err(|e| ResubmitError::Config(format!("{}: {}", file.display(), e)))?;
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e| ResubmitError::Config(e.to_string()))
    }

    /// Apply `BIPS_*` overrides from an iterator of environment variables
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "BIPS_TRIGGER_SOURCE" => self.monitor.trigger_source = value,
                "BIPS_BASE_DIR" => self.paths.base_dir = PathBuf::from(value),
                "BIPS_LOG_ROOT" => self.paths.log_root = PathBuf::from(value),
                "BIPS_LOG_LEVEL" => self.logging.log_level = value,
                _ => continue,
            }
            debug!("Configuration override from environment: {}", key);
        }
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.monitor.poll_interval_secs.is_finite() || self.monitor.poll_interval_secs <= 0.0
        {
            errors.push(format!(
                "monitor.poll_interval_secs must be positive, got {}",
                self.monitor.poll_interval_secs
            ));
        }
        if self.monitor.automated_source.trim().is_empty() {
            errors.push("monitor.automated_source must not be empty".to_string());
        }
        if self.wrapper.executable.trim().is_empty() {
            errors.push("wrapper.executable must not be empty".to_string());
        }
        if self.wrapper.scheduler_kind.trim().is_empty() {
            errors.push("wrapper.scheduler_kind must not be empty".to_string());
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "logging.log_level must be one of {:?}, got '{}'",
                VALID_LOG_LEVELS, self.logging.log_level
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Serialize to TOML, e.g. for `--show-config`
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ResubmitError::Config(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?).map_err(|e| ResubmitError::io(path, e))
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
