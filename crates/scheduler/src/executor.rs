//! Execution contract between the scheduler and a transcoding engine.
//!
//! The engine is an opaque unit of work: it takes one resolved job, a
//! cancellation token, and a progress callback, and returns exactly one
//! terminal [`Outcome`]. Failure kinds are classified here so the retry
//! policy can decide retry vs terminal without inspecting messages.

use crate::job::JobSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine binary could not be spawned.
    EngineNotFound,
    /// The engine exited with a non-zero status code.
    NonZeroExit,
    /// The engine was terminated by a signal.
    Signal,
    /// The job exceeded its configured maximum runtime.
    Timeout,
    /// The target could not be written due to permissions.
    PermissionDenied,
    /// The source cannot be converted by the engine.
    UnsupportedFormat,
    /// The source file does not exist.
    SourceMissing,
    /// The engine reported success but produced no output file.
    OutputMissing,
    /// Some other I/O error while driving the engine.
    Io,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::EngineNotFound => write!(f, "engine_not_found"),
            FailureKind::NonZeroExit => write!(f, "non_zero_exit"),
            FailureKind::Signal => write!(f, "signal"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::PermissionDenied => write!(f, "permission_denied"),
            FailureKind::UnsupportedFormat => write!(f, "unsupported_format"),
            FailureKind::SourceMissing => write!(f, "source_missing"),
            FailureKind::OutputMissing => write!(f, "output_missing"),
            FailureKind::Io => write!(f, "io"),
        }
    }
}

/// Terminal result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The conversion finished and the output exists.
    Success,
    /// The conversion failed; the kind drives retry classification.
    Failure {
        kind: FailureKind,
        message: String,
    },
    /// The engine observed the cancellation token and aborted.
    Cancelled,
}

impl Outcome {
    /// Shorthand for a failure outcome.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// A transcoding engine adapter.
///
/// Implementations must poll the cancellation token between internal steps
/// (cancellation is cooperative, never preemptive) and report progress
/// fractions in [0.0, 1.0] at a bounded interval.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn execute(
        &self,
        spec: &JobSpec,
        target: &Path,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Outcome;
}
