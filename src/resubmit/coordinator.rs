//! Eligibility gating and lifecycle of the unit monitors of one run

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::completion_marker::CompletionMarker;
use super::consolidator::{ConsolidationOutcome, ResultConsolidator};
use super::layout::ResubmitLayout;
use super::scheduler_config::SchedulerConfig;
use super::unit_key::UnitKey;
use super::unit_monitor::{MonitorContext, UnitMonitor, UnitReport, UnitState, UnitStatus};
use crate::config::ResubmitConfig;
use crate::errors::Result;
use crate::hpc::execution_wrapper::ExecutionWrapper;

/// Why a run is not eligible for resubmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    TriggerSource { found: String, expected: String },
    /// Resubmission supports exactly one scheduler configuration
    ConfigCount(usize),
    AdvancedFeatures(Vec<String>),
    UnreadableConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    /// Decide eligibility from already-parsed scheduler configurations
    pub fn evaluate(
        trigger_source: &str,
        automated_source: &str,
        configs: &[SchedulerConfig],
    ) -> Self {
        if trigger_source != automated_source {
            return Eligibility::Ineligible(IneligibleReason::TriggerSource {
                found: trigger_source.to_string(),
                expected: automated_source.to_string(),
            });
        }
        if configs.len() != 1 {
            return Eligibility::Ineligible(IneligibleReason::ConfigCount(configs.len()));
        }
        let features = configs[0].advanced_features();
        if !features.is_empty() {
            return Eligibility::Ineligible(IneligibleReason::AdvancedFeatures(
                features.into_iter().map(str::to_string).collect(),
            ));
        }
        Eligibility::Eligible
    }
}

/// Inputs of a resubmission run
#[derive(Debug, Clone)]
pub struct ResubmitSettings {
    pub trigger_source: String,
    pub automated_source: String,
    pub scheduler_configs: Vec<PathBuf>,
    pub scheduler_kind: String,
    pub poll_interval: Duration,
}

impl ResubmitSettings {
    pub fn from_config(config: &ResubmitConfig) -> Self {
        Self {
            trigger_source: config.monitor.trigger_source.clone(),
            automated_source: config.monitor.automated_source.clone(),
            scheduler_configs: config.monitor.scheduler_configs.clone(),
            scheduler_kind: config.wrapper.scheduler_kind.clone(),
            poll_interval: config.monitor.poll_interval(),
        }
    }
}

/// Counts of the artifacts a finished resubmission leaves behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionCounts {
    pub results_dirs: usize,
    pub summaries: usize,
    pub output_dirs: usize,
}

impl CompletionCounts {
    pub fn collect(layout: &ResubmitLayout, units: &[UnitKey]) -> Self {
        let mut counts = Self::default();
        for unit in units {
            if layout.results_dir(unit).is_dir() {
                counts.results_dirs += 1;
            }
            if layout.unit_summary(unit).is_file() {
                counts.summaries += 1;
            }
            if layout.output_dir(unit).is_dir() {
                counts.output_dirs += 1;
            }
        }
        counts
    }

    /// All three counts are equal and positive
    pub fn is_complete(&self) -> bool {
        self.results_dirs > 0
            && self.results_dirs == self.summaries
            && self.summaries == self.output_dirs
    }

    /// Complete, and every one of the `expected` units is accounted for
    fn len_matches(&self, expected: usize) -> bool {
        self.is_complete() && self.results_dirs == expected
    }
}

/// Completion check that needs nothing but the filesystem, for callers outside the
/// process that ran the monitors. Units with a scoped configuration count as resubmitted.
pub fn resubmit_jobs_completed_on_disk(layout: &ResubmitLayout) -> Result<bool> {
    if CompletionMarker::for_layout(layout).exists() {
        return Ok(true);
    }
    let units = layout.resubmitted_units()?;
    if units.is_empty() {
        return Ok(true);
    }
    let counts = CompletionCounts::collect(layout, &units);
    debug!(
        "Resubmission artifacts units={} counts={:?}",
        units.len(),
        counts
    );
    Ok(counts.len_matches(units.len()))
}

/// Owned handle to one monitor thread
struct UnitHandle {
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<UnitStatus>>,
    thread: JoinHandle<UnitReport>,
}

impl UnitHandle {
    fn status(&self) -> UnitStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.thread().unpark();
    }

    fn join(self, unit: &UnitKey) -> UnitReport {
        match self.thread.join() {
            Ok(report) => report,
            Err(_) => {
                error!("Monitor thread panicked unit={}", unit);
                let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
                UnitReport {
                    unit: unit.to_string(),
                    transitions: vec![UnitState::Watching, UnitState::Done],
                    resubmitted: status.resubmitted,
                    wrapper_exit_code: None,
                }
            }
        }
    }
}

/// Runs one [`UnitMonitor`] per unit and consolidates their results.
///
/// ```ignore
/// let mut coordinator = ResubmitCoordinator::new(settings, layout, wrapper);
/// coordinator.start(&units);
/// // ... external monitoring polls coordinator.resubmit_jobs_completed()
/// coordinator.stop_and_join();
/// coordinator.finalize()?;
/// ```
pub struct ResubmitCoordinator {
    settings: ResubmitSettings,
    layout: Arc<ResubmitLayout>,
    wrapper: Arc<dyn ExecutionWrapper>,
    eligibility: OnceLock<Eligibility>,
    units: BTreeMap<UnitKey, UnitHandle>,
    reports: Vec<UnitReport>,
    resubmission_occurred: Arc<AtomicBool>,
    started: bool,
}

impl ResubmitCoordinator {
    pub fn new(
        settings: ResubmitSettings,
        layout: ResubmitLayout,
        wrapper: Arc<dyn ExecutionWrapper>,
    ) -> Self {
        Self {
            settings,
            layout: Arc::new(layout),
            wrapper,
            eligibility: OnceLock::new(),
            units: BTreeMap::new(),
            reports: Vec::new(),
            resubmission_occurred: Arc::new(AtomicBool::new(false)),
            started: false,
        }
    }

    pub fn layout(&self) -> &ResubmitLayout {
        &self.layout
    }

    /// Evaluated on first call and remembered for the lifetime of the coordinator
    pub fn evaluate_eligibility(&self) -> &Eligibility {
        self.eligibility.get_or_init(|| {
            let eligibility = self.compute_eligibility();
            match &eligibility {
                Eligibility::Eligible => info!("Run is eligible for automatic resubmission"),
                Eligibility::Ineligible(reason) => {
                    info!("Automatic resubmission disabled: {:?}", reason)
                }
            }
            eligibility
        })
    }

    fn compute_eligibility(&self) -> Eligibility {
        let mut configs = Vec::with_capacity(self.settings.scheduler_configs.len());
        for path in &self.settings.scheduler_configs {
            match SchedulerConfig::load(path) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    return Eligibility::Ineligible(IneligibleReason::UnreadableConfig(
                        e.to_string(),
                    ));
                }
            }
        }
        Eligibility::evaluate(
            &self.settings.trigger_source,
            &self.settings.automated_source,
            &configs,
        )
    }

    pub fn is_eligible(&self) -> bool {
        self.evaluate_eligibility().is_eligible()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawn one monitor per unit and return immediately.
    ///
    /// Skipped without error when the run is ineligible, when consolidation already
    /// completed in an earlier process, or when monitors were already started. Returns the
    /// number of monitors spawned.
    pub fn start(&mut self, units: &[UnitKey]) -> usize {
        if !self.is_eligible() {
            return 0;
        }
        let marker = CompletionMarker::for_layout(&self.layout);
        if marker.exists() {
            info!(
                "Resubmission already consolidated, skipping marker={}",
                marker.path().display()
            );
            return 0;
        }
        if self.started {
            warn!("Unit monitors already started");
            return 0;
        }
        self.started = true;

        let ctx = MonitorContext {
            layout: self.layout.clone(),
            wrapper: self.wrapper.clone(),
            scheduler_config: self.settings.scheduler_configs[0].clone(),
            scheduler_kind: self.settings.scheduler_kind.clone(),
            poll_interval: self.settings.poll_interval,
            resubmission_occurred: self.resubmission_occurred.clone(),
        };

        for unit in units {
            if self.units.contains_key(unit) {
                debug!("Duplicate unit ignored unit={}", unit);
                continue;
            }
            let stop = Arc::new(AtomicBool::new(false));
            let status = Arc::new(Mutex::new(UnitStatus::default()));
            let monitor =
                UnitMonitor::new(unit.clone(), ctx.clone(), stop.clone(), status.clone());
            let thread = match thread::Builder::new()
                .name(format!("resubmit-{}", unit))
                .spawn(move || monitor.run())
            {
                Ok(thread) => thread,
                Err(e) => {
                    error!("Failed to spawn monitor unit={}: {}", unit, e);
                    continue;
                }
            };
            self.units.insert(
                unit.clone(),
                UnitHandle {
                    stop,
                    status,
                    thread,
                },
            );
        }

        info!("Started unit monitors count={}", self.units.len());
        self.units.len()
    }

    /// True when every spawned monitor has reached `Done`
    pub fn all_units_done(&self) -> bool {
        self.units.values().all(|h| h.status().state.is_done())
    }

    pub fn unit_state(&self, unit: &UnitKey) -> Option<UnitState> {
        if let Some(handle) = self.units.get(unit) {
            return Some(handle.status().state);
        }
        self.reports
            .iter()
            .find(|r| r.unit == unit.as_str())
            .map(UnitReport::final_state)
    }

    /// Signal every monitor to stop and wait for all of them to reach `Done`
    pub fn stop_and_join(&mut self) -> &[UnitReport] {
        for handle in self.units.values() {
            handle.request_stop();
        }
        let units = std::mem::take(&mut self.units);
        for (unit, handle) in units {
            let report = handle.join(&unit);
            debug!(
                "Joined unit={} transitions={:?}",
                report.unit, report.transitions
            );
            self.reports.push(report);
        }
        &self.reports
    }

    pub fn reports(&self) -> &[UnitReport] {
        &self.reports
    }

    /// True if any unit went through `FailedKnown` in this run
    pub fn resubmission_occurred(&self) -> bool {
        self.resubmission_occurred.load(Ordering::SeqCst)
    }

    fn resubmitted_units(&self) -> Vec<UnitKey> {
        let live = self
            .units
            .iter()
            .filter(|(_, h)| h.status().resubmitted)
            .map(|(unit, _)| unit.clone());
        let joined = self
            .reports
            .iter()
            .filter(|r| r.resubmitted)
            .filter_map(|r| UnitKey::parse(&r.unit).ok());
        live.chain(joined).collect()
    }

    /// Polled by the job-completion checker before it declares the run finished.
    ///
    /// Never true while a monitor is short of `Done`. Once all are done, true if nothing
    /// was resubmitted, otherwise only when every resubmitted unit has its results
    /// directory, summary and output directory.
    pub fn resubmit_jobs_completed(&self) -> bool {
        if !self.is_eligible() || !self.started {
            return true;
        }
        if CompletionMarker::for_layout(&self.layout).exists() {
            return true;
        }
        if !self.all_units_done() {
            return false;
        }
        let units = self.resubmitted_units();
        if units.is_empty() {
            return true;
        }
        let counts = CompletionCounts::collect(&self.layout, &units);
        debug!(
            "Resubmission artifacts units={} counts={:?}",
            units.len(),
            counts
        );
        counts.len_matches(units.len())
    }

    /// Join the monitors and, if anything was resubmitted, consolidate the results.
    ///
    /// Returns `None` when there was nothing to consolidate.
    pub fn finalize(&mut self) -> Result<Option<ConsolidationOutcome>> {
        if !self.units.is_empty() {
            self.stop_and_join();
        }
        if !self.resubmission_occurred() {
            debug!("No resubmission occurred, nothing to consolidate");
            return Ok(None);
        }
        let consolidator = ResultConsolidator::new(self.layout.as_ref().clone());
        if consolidator.is_consolidated() {
            return Ok(None);
        }
        consolidator.consolidate().map(Some)
    }
}

impl Drop for ResubmitCoordinator {
    fn drop(&mut self) {
        if !self.units.is_empty() {
            self.stop_and_join();
        }
    }
}
