//! Resubmission of work units that failed on known transient faults.
//!
//! A run is partitioned into units keyed by calendar date. For an eligible run the
//! [`ResubmitCoordinator`] spawns one [`UnitMonitor`] thread per unit. Each monitor waits for
//! the unit's job output, and if the job died on one of the [`KNOWN_ERRORS`] it resubmits
//! that single unit through the execution wrapper. After every monitor has finished, the
//! [`ResultConsolidator`] merges the retried results into the canonical result set and
//! writes the [`CompletionMarker`].

pub mod classifier;
pub mod completion_marker;
pub mod consolidator;
pub mod coordinator;
pub mod layout;
pub mod scheduler_config;
pub mod unit_key;
pub mod unit_monitor;

pub use classifier::{
    FAILURE_MARKER, KNOWN_ERRORS, SUCCESS_MARKER, content_contains_known_error,
    file_contains_known_error,
};
pub use completion_marker::CompletionMarker;
pub use consolidator::{CompletionSummary, ConsolidationOutcome, ResultConsolidator, ResultTable};
pub use coordinator::{
    CompletionCounts, Eligibility, IneligibleReason, ResubmitCoordinator, ResubmitSettings,
    resubmit_jobs_completed_on_disk,
};
pub use layout::ResubmitLayout;
pub use scheduler_config::SchedulerConfig;
pub use unit_key::UnitKey;
pub use unit_monitor::{MonitorContext, UnitMonitor, UnitReport, UnitState};
