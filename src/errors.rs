//! Error types for the resubmission library

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by the resubmission library.
///
/// None of these abort a resubmission run on their own: the coordinator and the monitors
/// log them and degrade to "unit stays failed".
#[derive(Debug, Error)]
pub enum ResubmitError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse INI file {}: {message}", .path.display())]
    Ini { path: PathBuf, message: String },

    #[error("failed to read result table {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("result table {} has header {found:?}, expected {expected:?}", .path.display())]
    HeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("invalid unit key '{0}': expected an 8-digit calendar date (YYYYMMDD)")]
    InvalidUnitKey(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ResubmitError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn ini(path: impl AsRef<Path>, error: impl std::fmt::Display) -> Self {
        Self::Ini {
            path: path.as_ref().to_path_buf(),
            message: error.to_string(),
        }
    }

    pub fn csv(path: impl AsRef<Path>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResubmitError>;
