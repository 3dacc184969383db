//! Durable flag recording that consolidation has already run.
//!
//! The marker is an empty file. Its presence is the only signal that the canonical results
//! already include the resubmitted units; absence means consolidation is pending or was
//! never needed.

use log::info;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::layout::ResubmitLayout;
use crate::errors::{ResubmitError, Result};

#[derive(Debug, Clone)]
pub struct CompletionMarker {
    path: PathBuf,
}

impl CompletionMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_layout(layout: &ResubmitLayout) -> Self {
        Self::new(layout.completion_marker())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create the marker. Marking twice is harmless.
    pub fn mark(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ResubmitError::io(parent, e))?;
        }
        let file = File::create(&self.path).map_err(|e| ResubmitError::io(&self.path, e))?;
        file.sync_all()
            .map_err(|e| ResubmitError::io(&self.path, e))?;
        info!("Completion marker written path={}", self.path.display());
        Ok(())
    }
}
