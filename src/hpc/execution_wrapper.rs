//! Execution wrapper interface and its subprocess implementation

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use std::env;
use std::path::PathBuf;
use std::process::Command;

use crate::config::WrapperConfig;

/// Environment variable that replaces the wrapper executable (allows testing with a fake script)
pub const FAKE_WRAPPER_ENV: &str = "BIPS_FAKE_WRAPPER";

/// Everything the wrapper needs to rerun a single unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperInvocation {
    pub scheduler_kind: String,
    /// Scheduler configuration narrowed to the retried unit
    pub scoped_config: PathBuf,
    pub output_dir: PathBuf,
    /// Retry-input configuration pointing at the unit's results directory
    pub rs_input: PathBuf,
    pub log_path: PathBuf,
}

impl WrapperInvocation {
    /// Command-line arguments, in the order the wrapper expects them.
    ///
    /// `--no-notify` suppresses the e-mail the wrapper normally sends and `--wait` keeps it
    /// in the foreground until the Slurm job exits.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.scheduler_kind.clone(),
            self.scoped_config.to_string_lossy().to_string(),
            "--outdir".to_string(),
            self.output_dir.to_string_lossy().to_string(),
            "--rs-input".to_string(),
            self.rs_input.to_string_lossy().to_string(),
            "--log-path".to_string(),
            self.log_path.to_string_lossy().to_string(),
            "--no-notify".to_string(),
            "--wait".to_string(),
        ]
    }
}

/// Runs a resubmission synchronously.
///
/// The returned exit code is advisory: callers verify the output artifacts afterwards.
pub trait ExecutionWrapper: Send + Sync {
    fn run(&self, invocation: &WrapperInvocation) -> Result<i32>;
}

/// Executes the wrapper as a child process and blocks until it exits
#[derive(Debug, Clone)]
pub struct CommandWrapper {
    executable: String,
}

impl CommandWrapper {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Build from configuration, honoring the fake-wrapper override
    pub fn from_config(config: &WrapperConfig) -> Self {
        let executable =
            env::var(FAKE_WRAPPER_ENV).unwrap_or_else(|_| config.executable.clone());
        Self::new(executable)
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }
}

impl ExecutionWrapper for CommandWrapper {
    fn run(&self, invocation: &WrapperInvocation) -> Result<i32> {
        let args = invocation.args();
        info!("Running wrapper: {} {}", self.executable, args.join(" "));

        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .with_context(|| format!("Failed to execute wrapper '{}'", self.executable))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            trace!("[wrapper] {}", line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!("[wrapper] {}", line);
        }

        let return_code = output.status.code().unwrap_or(-1);
        debug!(
            "Wrapper exited return_code={} output_dir={}",
            return_code,
            invocation.output_dir.display()
        );
        Ok(return_code)
    }
}
