//! Automatic resubmission of BIPS Slurm jobs that failed on known transient faults.
//!
//! The crate watches the captured output of every work unit (one calendar date of a
//! regression run), resubmits units that died on an infrastructure fault exactly once,
//! and merges the results of the retries back into the canonical result set.
//!
//! The entry point is [`resubmit::ResubmitCoordinator`]. The `bips-resubmit` binary wires it
//! to the layered configuration in [`config`].

pub mod config;
pub mod errors;
pub mod hpc;
pub mod resubmit;

pub use errors::{ResubmitError, Result};
