//! Session snapshot persistence.
//!
//! The scheduler serializes its run state and the ordered job records to a
//! single JSON snapshot after every transition. The write goes to a temp
//! file in the same directory and is renamed into place, so a crash never
//! leaves a half-written snapshot. On startup the snapshot is restored and
//! any job that was `Running` at the crash reappears as `Queued` with its
//! attempt count unchanged — an interrupted attempt is not a failure.

use crate::job::{JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_concurrency() -> u32 {
    1
}

/// Durable image of the queue.
///
/// Unknown fields in a stored snapshot are ignored on load; missing fields
/// take the defaults below, so snapshots stay readable across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Whether dispatch was paused when the snapshot was taken.
    #[serde(default)]
    pub paused: bool,
    /// Configured worker slot count.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Job records in insertion order.
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

impl SessionSnapshot {
    /// Reclassify jobs interrupted mid-run.
    ///
    /// `Running` becomes `Queued` with attempts unchanged and progress
    /// reset; no failure outcome was ever observed for the interrupted
    /// attempt, so it does not count against the retry budget. Returns the
    /// number of jobs reclassified.
    pub fn restore_interrupted(&mut self) -> usize {
        let mut restored = 0;
        for record in &mut self.jobs {
            if record.status == JobStatus::Running {
                record.status = JobStatus::Queued;
                record.progress = 0.0;
                record.started_at_ms = None;
                record.cancel_requested = false;
                restored += 1;
            }
        }
        restored
    }
}

/// Reads and writes the session snapshot file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store backed by an explicit snapshot path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store using the conventional `session.json` inside a state directory.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("session.json"),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot atomically (temp file in the same directory, then
    /// rename over the target).
    pub fn save(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Load the snapshot, or None if no session was saved.
    pub fn load(&self) -> io::Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(snapshot))
    }

    /// Remove the snapshot after a clean drain.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
