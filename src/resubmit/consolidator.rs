//! Merging of resubmitted results into the canonical result set.
//!
//! Consolidation runs once, after every unit monitor has been joined. It folds each
//! `await_results/results_<unit>/` directory into the canonical `slurm_results.csv` and
//! `slurm_summary.ini`, then writes the completion marker. Both outputs are replaced
//! atomically and the marker is written last, so an interrupted consolidation is simply
//! run again: row deduplication and set union make a second pass a no-op.

use ini::Ini;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::completion_marker::CompletionMarker;
use super::layout::{RESULTS_FILE, ResubmitLayout, SUMMARY_FILE};
use crate::errors::{ResubmitError, Result};

const SUMMARY_SECTION: &str = "summary";

/// Tabular record of unit outcomes, one row per unit attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ResultTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| ResubmitError::csv(path, e))?;

        let headers = reader
            .headers()
            .map_err(|e| ResubmitError::csv(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ResubmitError::csv(path, e))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    /// Load `path`, or an empty table if it does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No result table at {}, starting empty", path.display());
            Ok(Self::default())
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tables can be merged when either side has no header yet or the headers match
    pub fn is_compatible(&self, other: &ResultTable) -> bool {
        self.headers.is_empty() || other.headers.is_empty() || self.headers == other.headers
    }

    /// Drop repeated rows, keeping the first occurrence. Returns the number removed.
    pub fn dedup(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        self.rows.retain(|row| seen.insert(row.clone()));
        before - self.rows.len()
    }

    /// Append the rows of `other` that are not already present. Returns the number added.
    pub fn merge(&mut self, other: ResultTable) -> usize {
        if self.headers.is_empty() {
            self.headers = other.headers;
        }
        let mut seen: HashSet<Vec<String>> = self.rows.iter().cloned().collect();
        let mut added = 0;
        for row in other.rows {
            if seen.insert(row.clone()) {
                self.rows.push(row);
                added += 1;
            }
        }
        added
    }

    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        write_atomic(path, |file| {
            let mut writer = csv::Writer::from_writer(file);
            if !self.headers.is_empty() {
                writer
                    .write_record(&self.headers)
                    .map_err(|e| ResubmitError::csv(path, e))?;
            }
            for row in &self.rows {
                writer
                    .write_record(row)
                    .map_err(|e| ResubmitError::csv(path, e))?;
            }
            writer.flush().map_err(|e| ResubmitError::io(path, e))
        })
    }
}

/// Completed and failed unit keys plus the overall return code of the run.
///
/// `completed` and `failed` are kept disjoint; a unit that completed on any attempt is
/// never reported as failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub returncode: Option<i32>,
}

fn split_keys(value: Option<&str>) -> BTreeSet<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(",")
}

impl CompletionSummary {
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| ResubmitError::ini(path, e))?;
        let Some(section) = ini.section(Some(SUMMARY_SECTION)) else {
            warn!(
                "Summary {} has no [{}] section, treating as empty",
                path.display(),
                SUMMARY_SECTION
            );
            return Ok(Self::default());
        };

        let returncode = match section.get("returncode") {
            Some(value) => Some(value.trim().parse::<i32>().map_err(|e| {
                ResubmitError::ini(path, format!("invalid returncode '{}': {}", value, e))
            })?),
            None => None,
        };

        let mut summary = Self {
            completed: split_keys(section.get("completed")),
            failed: split_keys(section.get("failed")),
            returncode,
        };
        summary.normalize();
        Ok(summary)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No summary at {}, starting empty", path.display());
            Ok(Self::default())
        }
    }

    /// Remove every completed key from the failed set
    fn normalize(&mut self) {
        let completed = &self.completed;
        self.failed.retain(|key| !completed.contains(key));
    }

    pub fn is_disjoint(&self) -> bool {
        self.completed.is_disjoint(&self.failed)
    }

    /// Fold a retried unit's summary into this one.
    ///
    /// Every key the retry completed moves to `completed` (a later success overrides an
    /// earlier failure); keys the retry failed are added to `failed` unless already
    /// completed. Returns the keys that were not completed before.
    pub fn merge_unit_summary(&mut self, unit: &CompletionSummary) -> Vec<String> {
        let mut gained = Vec::new();
        for key in &unit.completed {
            if self.completed.insert(key.clone()) {
                gained.push(key.clone());
            }
            self.failed.remove(key);
        }
        for key in &unit.failed {
            if !self.completed.contains(key) {
                self.failed.insert(key.clone());
            }
        }
        gained
    }

    /// Record `key` as failed unless some attempt completed it.
    ///
    /// Returns true when the key was not accounted for before.
    pub fn record_failed(&mut self, key: &str) -> bool {
        if self.completed.contains(key) {
            return false;
        }
        self.failed.insert(key.to_string())
    }

    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        {
            let mut section = ini.with_section(Some(SUMMARY_SECTION));
            section
                .set("completed", join_keys(&self.completed))
                .set("failed", join_keys(&self.failed));
            if let Some(returncode) = self.returncode {
                section.set("returncode", returncode.to_string());
            }
        }
        ini
    }

    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let ini = self.to_ini();
        write_atomic(path, |file| {
            ini.write_to(file).map_err(|e| ResubmitError::io(path, e))
        })
    }
}

/// Write through a temporary file in the destination directory, then rename over `path`
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut std::fs::File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| ResubmitError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| ResubmitError::io(dir, e))?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut()
        .flush()
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| ResubmitError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| ResubmitError::io(path, e.error))?;
    Ok(())
}

/// What a consolidation pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationOutcome {
    /// The completion marker already existed; nothing was touched
    pub already_consolidated: bool,
    pub rows_added: usize,
    pub duplicate_rows_removed: usize,
    /// Units that completed only thanks to their resubmission
    pub units_rescued: Vec<String>,
    pub units_failed: Vec<String>,
    pub returncode: Option<i32>,
    /// Per-unit artifacts that could not be read and were left out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_artifacts: Vec<PathBuf>,
}

pub struct ResultConsolidator {
    layout: ResubmitLayout,
    marker: CompletionMarker,
}

impl ResultConsolidator {
    pub fn new(layout: ResubmitLayout) -> Self {
        let marker = CompletionMarker::for_layout(&layout);
        Self { layout, marker }
    }

    pub fn is_consolidated(&self) -> bool {
        self.marker.exists()
    }

    /// Merge every per-unit result directory into the canonical results.
    ///
    /// Unreadable per-unit artifacts are logged and skipped. Failures on the canonical files
    /// are returned and leave the marker unwritten, so the next run retries.
    pub fn consolidate(&self) -> Result<ConsolidationOutcome> {
        if self.marker.exists() {
            info!(
                "Consolidation already done marker={}",
                self.marker.path().display()
            );
            return Ok(ConsolidationOutcome {
                already_consolidated: true,
                ..Default::default()
            });
        }

        let results_path = self.layout.canonical_results();
        let summary_path = self.layout.canonical_summary();
        let mut table = ResultTable::load_or_default(&results_path)?;
        let mut summary = CompletionSummary::load_or_default(&summary_path)?;

        let mut outcome = ConsolidationOutcome {
            duplicate_rows_removed: table.dedup(),
            ..Default::default()
        };

        for dir in self.layout.list_results_dirs()? {
            self.merge_results(&dir.join(RESULTS_FILE), &mut table, &mut outcome);
            self.merge_summary(&dir.join(SUMMARY_FILE), &mut summary, &mut outcome);
            // A retried unit stays accounted for even without a usable summary
            if let Some(unit) = ResubmitLayout::results_dir_unit(&dir)
                && summary.record_failed(unit.as_str())
            {
                warn!(
                    "Retried unit absent from its summary, recording as failed unit={} dir={}",
                    unit,
                    dir.display()
                );
            }
        }

        if !outcome.units_rescued.is_empty() {
            info!(
                "Resubmission rescued units={} forcing returncode=0",
                outcome.units_rescued.join(",")
            );
            summary.returncode = Some(0);
        }
        outcome.returncode = summary.returncode;
        outcome.units_failed = summary.failed.iter().cloned().collect();

        table.write_atomic(&results_path)?;
        summary.write_atomic(&summary_path)?;
        self.marker.mark()?;

        info!(
            "Consolidation complete rows_added={} rescued={} failed={} skipped={}",
            outcome.rows_added,
            outcome.units_rescued.len(),
            outcome.units_failed.len(),
            outcome.skipped_artifacts.len()
        );
        Ok(outcome)
    }

    fn merge_results(
        &self,
        path: &Path,
        table: &mut ResultTable,
        outcome: &mut ConsolidationOutcome,
    ) {
        if !path.exists() {
            warn!("Missing result table path={}", path.display());
            return;
        }
        match ResultTable::load(path) {
            Ok(unit_table) if table.is_compatible(&unit_table) => {
                outcome.rows_added += table.merge(unit_table);
            }
            Ok(unit_table) => {
                let err = ResubmitError::HeaderMismatch {
                    path: path.to_path_buf(),
                    expected: table.headers().to_vec(),
                    found: unit_table.headers().to_vec(),
                };
                warn!("Skipping result table: {}", err);
                outcome.skipped_artifacts.push(path.to_path_buf());
            }
            Err(e) => {
                warn!("Skipping result table: {}", e);
                outcome.skipped_artifacts.push(path.to_path_buf());
            }
        }
    }

    fn merge_summary(
        &self,
        path: &Path,
        summary: &mut CompletionSummary,
        outcome: &mut ConsolidationOutcome,
    ) {
        if !path.exists() {
            warn!("Missing summary path={}", path.display());
            return;
        }
        match CompletionSummary::load(path) {
            Ok(unit_summary) => {
                outcome
                    .units_rescued
                    .extend(summary.merge_unit_summary(&unit_summary));
            }
            Err(e) => {
                warn!("Skipping summary: {}", e);
                outcome.skipped_artifacts.push(path.to_path_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn row(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn headers() -> Vec<String> {
        row(&["date", "job_id", "status"])
    }

    #[test]
    fn test_merge_identical_row_once() {
        let mut table = ResultTable::new(headers(), vec![row(&["20240101", "11", "COMPLETED"])]);
        let incoming = ResultTable::new(headers(), vec![row(&["20240101", "11", "COMPLETED"])]);
        assert_eq!(table.merge(incoming.clone()), 0);
        assert_eq!(table.merge(incoming), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_merge_keeps_differing_retry_row() {
        let mut table = ResultTable::new(headers(), vec![row(&["20240102", "12", "FAILED"])]);
        let retry = ResultTable::new(headers(), vec![row(&["20240102", "31", "COMPLETED"])]);
        assert_eq!(table.merge(retry), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[1], row(&["20240102", "31", "COMPLETED"]));
    }

    #[test]
    fn test_merge_into_empty_adopts_headers() {
        let mut table = ResultTable::default();
        table.merge(ResultTable::new(headers(), vec![row(&["20240102", "31", "COMPLETED"])]));
        assert_eq!(table.headers(), headers().as_slice());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dedup() {
        let mut table = ResultTable::new(
            headers(),
            vec![
                row(&["20240101", "11", "COMPLETED"]),
                row(&["20240101", "11", "COMPLETED"]),
                row(&["20240102", "12", "FAILED"]),
            ],
        );
        assert_eq!(table.dedup(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_incompatible_headers() {
        let table = ResultTable::new(headers(), vec![]);
        let other = ResultTable::new(row(&["date", "state"]), vec![]);
        assert!(!table.is_compatible(&other));
        assert!(table.is_compatible(&ResultTable::default()));
    }

    #[test]
    fn test_table_write_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slurm_results.csv");
        let table = ResultTable::new(
            headers(),
            vec![row(&["20240101", "11", "COMPLETED, with note"])],
        );
        table.write_atomic(&path).unwrap();
        assert_eq!(ResultTable::load(&path).unwrap(), table);
    }

    #[test]
    fn test_ragged_table_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slurm_results.csv");
        fs::write(&path, "date,job_id,status\n20240102,12\n").unwrap();
        assert!(matches!(
            ResultTable::load(&path),
            Err(ResubmitError::Csv { .. })
        ));
    }

    #[test]
    fn test_later_success_overrides_failure() {
        let mut canonical = CompletionSummary {
            completed: keys(&["20240101"]),
            failed: keys(&["20240102", "20240104"]),
            returncode: Some(1),
        };
        let retry = CompletionSummary {
            completed: keys(&["20240102"]),
            failed: keys(&[]),
            returncode: Some(0),
        };

        let gained = canonical.merge_unit_summary(&retry);
        assert_eq!(gained, vec!["20240102".to_string()]);
        assert!(canonical.completed.contains("20240102"));
        assert!(!canonical.failed.contains("20240102"));
        assert!(canonical.failed.contains("20240104"));
        assert!(canonical.is_disjoint());
    }

    #[test]
    fn test_failed_retry_stays_failed() {
        let mut canonical = CompletionSummary {
            completed: keys(&["20240101"]),
            failed: keys(&[]),
            returncode: Some(1),
        };
        let retry = CompletionSummary {
            completed: keys(&[]),
            failed: keys(&["20240102", "20240101"]),
            returncode: Some(1),
        };

        assert!(canonical.merge_unit_summary(&retry).is_empty());
        assert!(canonical.failed.contains("20240102"));
        // completed on an earlier attempt, stays completed
        assert!(!canonical.failed.contains("20240101"));
        assert!(canonical.is_disjoint());
    }

    #[test]
    fn test_merge_already_completed_gains_nothing() {
        let mut canonical = CompletionSummary {
            completed: keys(&["20240102"]),
            ..Default::default()
        };
        let retry = CompletionSummary {
            completed: keys(&["20240102"]),
            ..Default::default()
        };
        assert!(canonical.merge_unit_summary(&retry).is_empty());
    }

    #[test]
    fn test_record_failed_respects_completed() {
        let mut summary = CompletionSummary {
            completed: keys(&["20240101"]),
            ..Default::default()
        };
        assert!(!summary.record_failed("20240101"));
        assert!(summary.record_failed("20240102"));
        assert!(!summary.record_failed("20240102"));
        assert_eq!(summary.failed, keys(&["20240102"]));
        assert!(summary.is_disjoint());
    }

    #[test]
    fn test_consolidate_without_unit_summary_records_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = ResubmitLayout::new(dir.path(), dir.path().join("logs"));
        let results_dir = layout.await_results_dir().join("results_20240102");
        fs::create_dir_all(&results_dir).unwrap();
        fs::write(
            results_dir.join(RESULTS_FILE),
            "date,job_id,status\n20240102,12,FAILED\n",
        )
        .unwrap();

        let consolidator = ResultConsolidator::new(layout.clone());
        let outcome = consolidator.consolidate().unwrap();
        assert_eq!(outcome.rows_added, 1);
        assert_eq!(outcome.units_failed, vec!["20240102".to_string()]);
        assert!(outcome.units_rescued.is_empty());
        assert!(consolidator.is_consolidated());

        let summary = CompletionSummary::load(&layout.canonical_summary()).unwrap();
        assert_eq!(summary.failed, keys(&["20240102"]));
    }

    #[test]
    fn test_summary_write_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slurm_summary.ini");
        let summary = CompletionSummary {
            completed: keys(&["20240101", "20240103"]),
            failed: keys(&["20240102"]),
            returncode: Some(1),
        };
        summary.write_atomic(&path).unwrap();
        assert_eq!(CompletionSummary::load(&path).unwrap(), summary);
    }

    #[test]
    fn test_summary_load_normalizes_overlap() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slurm_summary.ini");
        fs::write(
            &path,
            "[summary]\ncompleted = 20240101, 20240102\nfailed = 20240102,20240103\n",
        )
        .unwrap();
        let summary = CompletionSummary::load(&path).unwrap();
        assert_eq!(summary.completed, keys(&["20240101", "20240102"]));
        assert_eq!(summary.failed, keys(&["20240103"]));
        assert_eq!(summary.returncode, None);
    }

    #[test]
    fn test_summary_invalid_returncode_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slurm_summary.ini");
        fs::write(&path, "[summary]\nreturncode = abc\n").unwrap();
        assert!(matches!(
            CompletionSummary::load(&path),
            Err(ResubmitError::Ini { .. })
        ));
    }
}
