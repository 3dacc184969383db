//! Paths of the resubmission tree.
//!
//! ```text
//! <base>/slurm_results.csv
//! <base>/slurm_summary.ini
//! <base>/resubmit/
//!   config/slurm_<unit>.ini
//!   config/rs_input_<unit>.ini
//!   await_results/results_<unit>/slurm_results.csv
//!   await_results/results_<unit>/slurm_summary.ini
//!   <unit>_outdir/
//!   resubmission_completed.ready
//! <log_root>/<prefix>_<unit>.out
//! <log_root>/<unit>/
//! ```
//!
//! Every per-unit path contains the unit key, so monitors of different units never write
//! the same file.

use std::fs;
use std::path::{Path, PathBuf};

use super::unit_key::UnitKey;
use crate::errors::{ResubmitError, Result};

pub const RESULTS_FILE: &str = "slurm_results.csv";
pub const SUMMARY_FILE: &str = "slurm_summary.ini";
pub const COMPLETION_MARKER_FILE: &str = "resubmission_completed.ready";

const RESULTS_DIR_PREFIX: &str = "results_";
const SCOPED_CONFIG_PREFIX: &str = "slurm_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResubmitLayout {
    base_dir: PathBuf,
    log_root: PathBuf,
}

impl ResubmitLayout {
    pub fn new(base_dir: impl Into<PathBuf>, log_root: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            log_root: log_root.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    pub fn resubmit_dir(&self) -> PathBuf {
        self.base_dir.join("resubmit")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.resubmit_dir().join("config")
    }

    pub fn await_results_dir(&self) -> PathBuf {
        self.resubmit_dir().join("await_results")
    }

    pub fn canonical_results(&self) -> PathBuf {
        self.base_dir.join(RESULTS_FILE)
    }

    pub fn canonical_summary(&self) -> PathBuf {
        self.base_dir.join(SUMMARY_FILE)
    }

    pub fn completion_marker(&self) -> PathBuf {
        self.resubmit_dir().join(COMPLETION_MARKER_FILE)
    }

    pub fn scoped_config(&self, unit: &UnitKey) -> PathBuf {
        self.config_dir()
            .join(format!("{}{}.ini", SCOPED_CONFIG_PREFIX, unit))
    }

    pub fn rs_input(&self, unit: &UnitKey) -> PathBuf {
        self.config_dir().join(format!("rs_input_{}.ini", unit))
    }

    pub fn results_dir(&self, unit: &UnitKey) -> PathBuf {
        self.await_results_dir()
            .join(format!("{}{}", RESULTS_DIR_PREFIX, unit))
    }

    pub fn unit_results(&self, unit: &UnitKey) -> PathBuf {
        self.results_dir(unit).join(RESULTS_FILE)
    }

    pub fn unit_summary(&self, unit: &UnitKey) -> PathBuf {
        self.results_dir(unit).join(SUMMARY_FILE)
    }

    pub fn output_dir(&self, unit: &UnitKey) -> PathBuf {
        self.resubmit_dir().join(format!("{}_outdir", unit))
    }

    /// Log directory of the unit's original run, removed before the retry
    pub fn prior_log_dir(&self, unit: &UnitKey) -> PathBuf {
        self.log_root.join(unit.as_str())
    }

    pub fn wrapper_log_path(&self, unit: &UnitKey) -> PathBuf {
        self.log_root.join(format!("resubmit_{}", unit))
    }

    /// Per-unit results directories under `await_results/`, sorted by name
    pub fn list_results_dirs(&self) -> Result<Vec<PathBuf>> {
        list_prefixed(&self.await_results_dir(), RESULTS_DIR_PREFIX, |p| p.is_dir())
    }

    /// Unit whose retry results a `results_<unit>` directory holds
    pub fn results_dir_unit(dir: &Path) -> Option<UnitKey> {
        let name = dir.file_name()?.to_str()?;
        UnitKey::parse(name.strip_prefix(RESULTS_DIR_PREFIX)?).ok()
    }

    /// Units that have a scoped configuration, i.e. units a resubmission was attempted for
    pub fn resubmitted_units(&self) -> Result<Vec<UnitKey>> {
        let configs = list_prefixed(&self.config_dir(), SCOPED_CONFIG_PREFIX, |p| p.is_file())?;
        Ok(configs
            .iter()
            .filter_map(|p| p.file_stem()?.to_str())
            .filter_map(|stem| stem.strip_prefix(SCOPED_CONFIG_PREFIX))
            .filter_map(|token| UnitKey::parse(token).ok())
            .collect())
    }
}

fn list_prefixed(dir: &Path, prefix: &str, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| ResubmitError::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ResubmitError::io(dir, e))?;
        let path = entry.path();
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if matches && keep(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
