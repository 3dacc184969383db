//! Interfaces to the cluster-side collaborators of a resubmission run.
//!
//! The scheduler itself is never driven directly: a resubmission is performed by the
//! BIPS execution wrapper, which submits and waits for the Slurm job on our behalf.

pub mod execution_wrapper;

pub use execution_wrapper::{CommandWrapper, ExecutionWrapper, WrapperInvocation};
