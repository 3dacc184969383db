//! Monitoring configuration for resubmission runs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Trigger source that marks a run as an automated regression test
pub const DEFAULT_AUTOMATED_SOURCE: &str = "regression";

pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 30.0;

/// Configuration for eligibility gating and per-unit monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Trigger source of the current run (e.g. "regression", "manual", "cron")
    pub trigger_source: String,

    /// Only runs triggered by this source are eligible for resubmission
    pub automated_source: String,

    /// Scheduler configuration files submitted for this run.
    /// Resubmission requires exactly one.
    pub scheduler_configs: Vec<PathBuf>,

    /// Work units to monitor. When empty, the units are read from the DATES
    /// directive of the scheduler configuration.
    pub units: Vec<String>,

    /// Seconds between polls of a unit's job output
    pub poll_interval_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            trigger_source: String::new(),
            automated_source: DEFAULT_AUTOMATED_SOURCE.to_string(),
            scheduler_configs: Vec::new(),
            units: Vec::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl MonitorConfig {
    /// Poll interval, falling back to the default unless the setting is finite and positive
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS))
    }
}

/// Filesystem roots shared by every unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Run directory holding the canonical results and the `resubmit/` tree
    pub base_dir: PathBuf,

    /// Directory where Slurm writes the captured job output
    pub log_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            log_root: PathBuf::from("logs"),
        }
    }
}
