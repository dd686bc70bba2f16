//! Normalized entity structs.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Canonical rendering of a demo's capture time (minute precision).
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// A demo recording discovered on a remote server.
///
/// Built in memory during a sync pass from a parsed remote filename. The
/// `id` stays `None` until the record is committed to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoMetadata {
    pub id: Option<String>,
    /// Configured server name the demo came from.
    pub server: String,
    /// Remote basename, also the local file name.
    pub filename: String,
    /// Deterministic local path: `demodir / server / filename`.
    pub filepath: PathBuf,
    pub map: String,
    pub captured_at: NaiveDateTime,
}

impl DemoMetadata {
    /// Capture time in the canonical `YYYY-MM-DD HH:MM` form.
    pub fn datetime(&self) -> String {
        self.captured_at.format(DATETIME_FORMAT).to_string()
    }

    /// Directory the demo is stored in (the per-server subdirectory).
    pub fn local_dir(&self) -> Option<&Path> {
        self.filepath.parent()
    }
}

/// Local storage location for a server's demo.
///
/// Pure function of its inputs; presence on disk at this path is what
/// decides whether a remote demo still needs downloading.
pub fn demo_path(demodir: &Path, server: &str, filename: &str) -> PathBuf {
    demodir.join(server).join(filename)
}
