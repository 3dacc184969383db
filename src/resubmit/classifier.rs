//! Detection of known transient infrastructure faults in captured job output

use std::fs;
use std::path::Path;

use crate::errors::{ResubmitError, Result};

/// Written by BIPS as the last line of a successful run
pub const SUCCESS_MARKER: &str = "BIPS EXECUTION FINISHED SUCCESSFULLY";

/// Written by BIPS when any stage of the run fails
pub const FAILURE_MARKER: &str = "BIPS EXECUTION FAILED";

/// Signatures of faults that a bare resubmission is expected to fix.
/// Matching is a case-sensitive literal substring test against each line.
pub const KNOWN_ERRORS: &[&str] = &[
    "No space left on device",
    "Killed",
    "Segmentation fault",
    // HDF5 file-lock contention on the shared filesystem
    "Unable to lock file, errno = 11",
    "Bus error",
    "DUE TO TIME LIMIT",
];

/// First known signature found in `content`, scanning line by line
pub fn matched_signature(content: &str) -> Option<&'static str> {
    content
        .lines()
        .find_map(|line| KNOWN_ERRORS.iter().copied().find(|sig| line.contains(sig)))
}

pub fn content_contains_known_error(content: &str) -> bool {
    matched_signature(content).is_some()
}

/// Read a job output file and check it for a known signature.
///
/// A missing or unreadable file is an error, never `false`.
pub fn file_contains_known_error(path: &Path) -> Result<bool> {
    let bytes = fs::read(path).map_err(|e| ResubmitError::io(path, e))?;
    Ok(content_contains_known_error(&String::from_utf8_lossy(&bytes)))
}
