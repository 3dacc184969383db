//! Per-unit monitoring thread.
//!
//! A [`UnitMonitor`] watches the job output of one unit until the job reaches a terminal
//! state. A failure caused by a known transient fault triggers a single resubmission of
//! that unit through the execution wrapper; everything else ends the monitor without
//! action. Cancellation is cooperative: the stop flag is checked only at the top of the
//! poll loop, so a deletion or a wrapper run in progress always completes first.

use ini::Ini;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::classifier::{FAILURE_MARKER, SUCCESS_MARKER, matched_signature};
use super::layout::ResubmitLayout;
use super::scheduler_config::mutate_config_file;
use super::unit_key::{UnitKey, artifact_belongs_to};
use crate::errors::{ResubmitError, Result};
use crate::hpc::execution_wrapper::{ExecutionWrapper, WrapperInvocation};

/// Lifecycle of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnitState {
    /// No terminal job output yet
    Watching,
    Succeeded,
    /// Failed on a known transient fault; will be resubmitted
    FailedKnown,
    /// Failed for another reason; permanent
    FailedUnknown,
    Resubmitting,
    /// The execution wrapper is running the retry
    AwaitingCompletion,
    Done,
}

impl UnitState {
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Watching, Succeeded | FailedKnown | FailedUnknown | Done)
                | (Succeeded | FailedUnknown, Done)
                | (FailedKnown, Resubmitting)
                | (Resubmitting, AwaitingCompletion | Done)
                | (AwaitingCompletion, Done)
        )
    }

    pub fn is_done(self) -> bool {
        self == UnitState::Done
    }
}

/// State shared between a monitor thread and its handle in the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    pub state: UnitState,
    pub resubmitted: bool,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            state: UnitState::Watching,
            resubmitted: false,
        }
    }
}

/// Returned by a monitor thread when it finishes
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    /// Every state the unit went through, starting with `Watching`
    pub transitions: Vec<UnitState>,
    pub resubmitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper_exit_code: Option<i32>,
}

impl UnitReport {
    pub fn final_state(&self) -> UnitState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(UnitState::Watching)
    }
}

/// Settings shared by every monitor of a run
#[derive(Clone)]
pub struct MonitorContext {
    pub layout: Arc<ResubmitLayout>,
    pub wrapper: Arc<dyn ExecutionWrapper>,
    /// The run's scheduler configuration, narrowed per unit on resubmission
    pub scheduler_config: PathBuf,
    pub scheduler_kind: String,
    pub poll_interval: Duration,
    /// Set by any monitor that resubmits; never cleared
    pub resubmission_occurred: Arc<AtomicBool>,
}

/// Terminal outcome read from a unit's job output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Succeeded,
    FailedKnown,
    FailedUnknown,
}

pub struct UnitMonitor {
    unit: UnitKey,
    ctx: MonitorContext,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<UnitStatus>>,
    transitions: Vec<UnitState>,
    wrapper_exit_code: Option<i32>,
}

impl UnitMonitor {
    pub fn new(
        unit: UnitKey,
        ctx: MonitorContext,
        stop: Arc<AtomicBool>,
        status: Arc<Mutex<UnitStatus>>,
    ) -> Self {
        Self {
            unit,
            ctx,
            stop,
            status,
            transitions: vec![UnitState::Watching],
            wrapper_exit_code: None,
        }
    }

    pub fn unit(&self) -> &UnitKey {
        &self.unit
    }

    fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn state(&self) -> UnitState {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    fn transition(&mut self, next: UnitState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(
                "Unexpected transition unit={} from={:?} to={:?}",
                self.unit, current, next
            );
        }
        debug!("Unit transition unit={} {:?} -> {:?}", self.unit, current, next);
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.state = next;
            if next == UnitState::Resubmitting {
                status.resubmitted = true;
            }
        }
        self.transitions.push(next);
    }

    /// Run the poll loop to completion and report what happened.
    pub fn run(mut self) -> UnitReport {
        info!("Monitoring unit={}", self.unit);

        if self.ctx.layout.scoped_config(&self.unit).exists() {
            // A previous process already resubmitted this unit; never resubmit twice.
            info!(
                "Unit already resubmitted by an earlier run unit={}",
                self.unit
            );
            self.ctx.resubmission_occurred.store(true, Ordering::SeqCst);
            self.status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .resubmitted = true;
            return self.finish();
        }

        while !self.is_stop_requested() {
            match self.poll() {
                Some(Observation::Succeeded) => {
                    info!("Unit succeeded unit={}", self.unit);
                    self.transition(UnitState::Succeeded);
                    break;
                }
                Some(Observation::FailedUnknown) => {
                    warn!(
                        "Unit failed without a known transient error, not resubmitting unit={}",
                        self.unit
                    );
                    self.transition(UnitState::FailedUnknown);
                    break;
                }
                Some(Observation::FailedKnown) => {
                    self.transition(UnitState::FailedKnown);
                    self.resubmit();
                    break;
                }
                None => thread::park_timeout(self.ctx.poll_interval),
            }
        }

        self.finish()
    }

    fn finish(mut self) -> UnitReport {
        self.stop.store(true, Ordering::SeqCst);
        self.transition(UnitState::Done);
        let resubmitted = self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resubmitted;
        info!(
            "Unit done unit={} resubmitted={} wrapper_exit_code={:?}",
            self.unit, resubmitted, self.wrapper_exit_code
        );
        UnitReport {
            unit: self.unit.to_string(),
            transitions: self.transitions,
            resubmitted,
            wrapper_exit_code: self.wrapper_exit_code,
        }
    }

    /// Job output files in the log root that belong to this unit
    fn output_artifacts(&self) -> Result<Vec<PathBuf>> {
        let log_root = self.ctx.layout.log_root();
        let entries = fs::read_dir(log_root).map_err(|e| ResubmitError::io(log_root, e))?;
        let mut artifacts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if artifact_belongs_to(name, &self.unit) {
                artifacts.push(path);
            } else {
                debug!("Ignoring artifact for other or invalid unit file={}", name);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Inspect the unit's job output once. `None` while no terminal marker is present.
    fn poll(&self) -> Option<Observation> {
        let artifacts = match self.output_artifacts() {
            Ok(artifacts) => artifacts,
            Err(e) => {
                debug!("No job output yet unit={}: {}", self.unit, e);
                return None;
            }
        };

        let mut succeeded = false;
        let mut failed_outputs = Vec::new();
        for path in artifacts {
            let content = match fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    debug!("Could not read job output {}: {}", path.display(), e);
                    continue;
                }
            };
            if content.contains(SUCCESS_MARKER) {
                succeeded = true;
            }
            if content.contains(FAILURE_MARKER) {
                failed_outputs.push((path, content));
            }
        }

        if !failed_outputs.is_empty() && !succeeded {
            let known = failed_outputs
                .iter()
                .any(|(path, content)| self.is_known_failure(path, content));
            Some(if known {
                Observation::FailedKnown
            } else {
                Observation::FailedUnknown
            })
        } else if succeeded {
            Some(Observation::Succeeded)
        } else {
            None
        }
    }

    /// Classify output already read by `poll`, so the file is not read twice
    fn is_known_failure(&self, path: &Path, content: &str) -> bool {
        match matched_signature(content) {
            Some(signature) => {
                info!(
                    "Known transient error unit={} file={} signature={:?}",
                    self.unit,
                    path.display(),
                    signature
                );
                true
            }
            None => false,
        }
    }

    /// Resubmit this unit exactly once. Errors are logged; the unit ends `Done` either way.
    fn resubmit(&mut self) {
        self.ctx.resubmission_occurred.store(true, Ordering::SeqCst);
        self.transition(UnitState::Resubmitting);

        // Removed before the retry is prepared: if the wrapper fails to start, the prior
        // output of this unit is already gone.
        let prior = self.ctx.layout.prior_log_dir(&self.unit);
        if prior.exists() {
            match fs::remove_dir_all(&prior) {
                Ok(()) => info!("Removed prior log directory {}", prior.display()),
                Err(e) => error!(
                    "Failed to remove prior log directory {}: {}",
                    prior.display(),
                    e
                ),
            }
        }

        let invocation = match self.prepare_retry() {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("Failed to prepare resubmission unit={}: {}", self.unit, e);
                return;
            }
        };

        self.transition(UnitState::AwaitingCompletion);
        info!(
            "Resubmitting unit={} config={}",
            self.unit,
            invocation.scoped_config.display()
        );
        match self.ctx.wrapper.run(&invocation) {
            Ok(0) => {
                info!("Resubmission finished unit={}", self.unit);
                self.wrapper_exit_code = Some(0);
            }
            Ok(code) => {
                warn!(
                    "Resubmission wrapper exited with non-zero code unit={} return_code={}",
                    self.unit, code
                );
                self.wrapper_exit_code = Some(code);
            }
            Err(e) => error!("Resubmission wrapper failed unit={}: {:#}", self.unit, e),
        }
    }

    /// Write the scoped config, the results directory and the retry-input config
    fn prepare_retry(&self) -> Result<WrapperInvocation> {
        let layout = &self.ctx.layout;

        let scoped_config = layout.scoped_config(&self.unit);
        mutate_config_file(&self.ctx.scheduler_config, &scoped_config, &self.unit)?;

        let results_dir = layout.results_dir(&self.unit);
        fs::create_dir_all(&results_dir).map_err(|e| ResubmitError::io(&results_dir, e))?;

        let rs_input = layout.rs_input(&self.unit);
        let mut ini = Ini::new();
        ini.with_section(Some("main"))
            .set("await_results_path", results_dir.to_string_lossy().to_string());
        ini.write_to_file(&rs_input)
            .map_err(|e| ResubmitError::io(&rs_input, e))?;

        Ok(WrapperInvocation {
            scheduler_kind: self.ctx.scheduler_kind.clone(),
            scoped_config,
            output_dir: layout.output_dir(&self.unit),
            rs_input,
            log_path: layout.wrapper_log_path(&self.unit),
        })
    }
}
