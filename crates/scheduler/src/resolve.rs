//! Overwrite resolution for target paths.
//!
//! Decides, before a job's first attempt, what to do when the target path
//! is already taken: skip the job, replace the file, or pick a numbered
//! variant. Existence is abstracted behind a predicate so the scheduler can
//! combine the filesystem with paths already reserved by queued jobs.

use crate::job::ValidationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on the numbered variants tried by the unique policy.
const MAX_UNIQUE_VARIANTS: u32 = 9_999;

/// What to do when a target path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Leave the existing file alone and skip the job.
    Skip,
    /// Overwrite the existing file.
    Replace,
    /// Append an incrementing ` (n)` suffix until an unused name is found.
    Unique,
}

impl OverwritePolicy {
    /// Parse a policy from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "skip" => Some(OverwritePolicy::Skip),
            "replace" => Some(OverwritePolicy::Replace),
            "unique" => Some(OverwritePolicy::Unique),
            _ => None,
        }
    }
}

impl Default for OverwritePolicy {
    fn default() -> Self {
        Self::Unique
    }
}

impl std::fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverwritePolicy::Skip => write!(f, "skip"),
            OverwritePolicy::Replace => write!(f, "replace"),
            OverwritePolicy::Unique => write!(f, "unique"),
        }
    }
}

/// Outcome of overwrite resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch the job writing to this path.
    Target(PathBuf),
    /// Do not dispatch; the path already exists under the skip policy.
    Skip(PathBuf),
}

/// Resolve a desired target path against an existence predicate.
///
/// Deterministic for a fixed predicate. The existence check happens here,
/// at resolution time, not again at dispatch; the gap is accepted and the
/// engine's own open-for-write is the final word.
pub fn resolve_target<F>(
    desired: &Path,
    policy: OverwritePolicy,
    exists: F,
) -> Result<Resolution, ValidationError>
where
    F: Fn(&Path) -> bool,
{
    match policy {
        OverwritePolicy::Skip => {
            if exists(desired) {
                Ok(Resolution::Skip(desired.to_path_buf()))
            } else {
                Ok(Resolution::Target(desired.to_path_buf()))
            }
        }
        OverwritePolicy::Replace => Ok(Resolution::Target(desired.to_path_buf())),
        OverwritePolicy::Unique => {
            if !exists(desired) {
                return Ok(Resolution::Target(desired.to_path_buf()));
            }
            for n in 1..=MAX_UNIQUE_VARIANTS {
                let candidate = numbered_variant(desired, n);
                if !exists(&candidate) {
                    return Ok(Resolution::Target(candidate));
                }
            }
            Err(ValidationError::UniqueNamesExhausted(desired.to_path_buf()))
        }
    }
}

/// Build the nth numbered variant of a path: `dir/stem (n).ext`.
fn numbered_variant(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("converted_file");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{} ({}).{}", stem, n, ext),
        None => format!("{} ({})", stem, n),
    };
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
