use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file queued for import into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportItem {
    pub path: PathBuf,
    pub importer: String,
    pub entry_point: String,
    /// Set once the import has been handed to a pipeline.
    pub started: Option<DateTime<Utc>>,
}

impl ImportItem {
    pub fn new(path: impl Into<PathBuf>, importer: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            importer: importer.into(),
            entry_point: entry_point.into(),
            started: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    /// Same file through the same importer into the same entry point.
    pub fn same_source(&self, other: &ImportItem) -> bool {
        self.path == other.path && self.importer == other.importer && self.entry_point == other.entry_point
    }
}
