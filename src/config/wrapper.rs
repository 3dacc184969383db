//! Execution wrapper configuration

use serde::{Deserialize, Serialize};

/// Configuration for the external script that performs a resubmission run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    /// Path to the execution wrapper
    pub executable: String,

    /// Scheduler kind passed as the wrapper's first argument
    pub scheduler_kind: String,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            executable: "run_bips".to_string(),
            scheduler_kind: "slurm".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Write the log to this file instead of stderr
    pub log_file: Option<std::path::PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}
