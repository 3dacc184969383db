#![allow(dead_code)]

use ini::Ini;
use rstest::fixture;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use slurm_resubmit::hpc::{ExecutionWrapper, WrapperInvocation};
use slurm_resubmit::resubmit::{ResubmitLayout, ResubmitSettings, SchedulerConfig, UnitKey};

pub const RESULT_HEADERS: &str = "date,status,value";

pub const SCHEDULER_CONFIG: &str = "\
# regional regression run
JOB_NAME=\"bips-regional\"
DATES=\"20240101 20240102 20240103\"
export CLEAR_DIR=true
NODES=4
";

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn unit(key: &str) -> UnitKey {
    UnitKey::parse(key).expect("valid unit key")
}

pub fn units(keys: &[&str]) -> Vec<UnitKey> {
    keys.iter().map(|k| unit(k)).collect()
}

/// Temporary run directory with a scheduler configuration and an empty log root
pub struct RunWorkspace {
    _dir: TempDir,
    pub layout: ResubmitLayout,
    pub scheduler_config: PathBuf,
}

impl RunWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let base = dir.path().join("run");
        let log_root = base.join("logs");
        fs::create_dir_all(&log_root).expect("Failed to create log root");

        let scheduler_config = base.join("slurm.ini");
        fs::write(&scheduler_config, SCHEDULER_CONFIG).expect("Failed to write config");

        Self {
            _dir: dir,
            layout: ResubmitLayout::new(base, log_root),
            scheduler_config,
        }
    }

    pub fn settings(&self, trigger_source: &str) -> ResubmitSettings {
        ResubmitSettings {
            trigger_source: trigger_source.to_string(),
            automated_source: "regression".to_string(),
            scheduler_configs: vec![self.scheduler_config.clone()],
            scheduler_kind: "slurm".to_string(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Write the captured Slurm output of a unit's original job
    pub fn write_output(&self, unit: &str, body: &str) -> PathBuf {
        let path = self.layout.log_root().join(format!("bips_{}.out", unit));
        fs::write(&path, body).expect("Failed to write job output");
        path
    }

    /// Create the unit's prior log directory with one file in it
    pub fn write_prior_logs(&self, key: &str) -> PathBuf {
        let dir = self.layout.prior_log_dir(&unit(key));
        fs::create_dir_all(&dir).expect("Failed to create prior log dir");
        fs::write(dir.join("model.log"), "step 1\nstep 2\n").expect("Failed to write log");
        dir
    }

    /// Canonical results of the original run: `rows` plus a summary
    pub fn write_canonical(&self, rows: &[&str], completed: &str, failed: &str, returncode: i32) {
        write_table(&self.layout.canonical_results(), rows);
        write_summary(
            &self.layout.canonical_summary(),
            completed,
            failed,
            Some(returncode),
        );
    }

    pub fn read_canonical_results(&self) -> String {
        fs::read_to_string(self.layout.canonical_results()).expect("Failed to read results")
    }
}

#[fixture]
pub fn workspace() -> RunWorkspace {
    RunWorkspace::new()
}

pub fn write_table(path: &Path, rows: &[&str]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create table dir");
    }
    let mut content = format!("{}\n", RESULT_HEADERS);
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(path, content).expect("Failed to write table");
}

pub fn write_summary(path: &Path, completed: &str, failed: &str, returncode: Option<i32>) {
    let mut ini = Ini::new();
    {
        let mut section = ini.with_section(Some("summary"));
        section.set("completed", completed).set("failed", failed);
        if let Some(code) = returncode {
            section.set("returncode", code.to_string());
        }
    }
    ini.write_to_file(path).expect("Failed to write summary");
}

/// Poll `condition` until it holds or the timeout passes
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Completes,
    Fails,
}

/// Stand-in for the execution wrapper that produces the artifacts a real retry would.
///
/// The retried unit is read back from the scoped configuration and the results directory
/// from the retry-input file, so the test exercises the same contract as the real wrapper.
pub struct RecordingWrapper {
    outcome: RetryOutcome,
    gate: Option<Arc<AtomicBool>>,
    invocations: Mutex<Vec<WrapperInvocation>>,
}

impl RecordingWrapper {
    pub fn new(outcome: RetryOutcome) -> Self {
        Self {
            outcome,
            gate: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Block every run until `gate` is set
    pub fn gated(outcome: RetryOutcome, gate: Arc<AtomicBool>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(outcome)
        }
    }

    pub fn invocations(&self) -> Vec<WrapperInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl ExecutionWrapper for RecordingWrapper {
    fn run(&self, invocation: &WrapperInvocation) -> anyhow::Result<i32> {
        self.invocations.lock().unwrap().push(invocation.clone());

        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        }

        let scoped = SchedulerConfig::load(&invocation.scoped_config)?;
        let dates = scoped.dates();
        let unit = dates
            .first()
            .ok_or_else(|| anyhow::anyhow!("scoped config has no DATES"))?;

        let rs_input = Ini::load_from_file(&invocation.rs_input)?;
        let results_dir = rs_input
            .get_from(Some("main"), "await_results_path")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("rs_input has no await_results_path"))?;

        fs::create_dir_all(&invocation.output_dir)?;
        let (row, completed, failed, code) = match self.outcome {
            RetryOutcome::Completes => (format!("{},success,2.5", unit), unit.as_str(), "", 0),
            RetryOutcome::Fails => (format!("{},failed,", unit), "", unit.as_str(), 1),
        };
        write_table(&results_dir.join("slurm_results.csv"), &[row.as_str()]);
        write_summary(
            &results_dir.join("slurm_summary.ini"),
            completed,
            failed,
            Some(code),
        );
        Ok(code)
    }
}
