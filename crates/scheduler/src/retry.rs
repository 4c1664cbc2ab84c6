//! Retry policy for failed execution attempts.
//!
//! A pure mapping from (attempt count, failure kind) to the next action:
//! retry after an exponentially growing delay, or give up. The
//! retryable/terminal split is an explicit table over [`FailureKind`] so it
//! can be tested on its own.

use crate::executor::FailureKind;
use std::time::Duration;
use vid2aud_config::ProcessingConfig;

/// Whether a failure kind is worth retrying at all.
///
/// Transient kinds (the engine died, timed out, or tripped over I/O) may
/// succeed on a later attempt. Kinds that describe the request itself
/// (missing source, unsupported format, no engine, no permission) will fail
/// identically every time.
pub fn is_retryable(kind: FailureKind) -> bool {
    match kind {
        FailureKind::NonZeroExit
        | FailureKind::Signal
        | FailureKind::Timeout
        | FailureKind::OutputMissing
        | FailureKind::Io => true,
        FailureKind::EngineNotFound
        | FailureKind::PermissionDenied
        | FailureKind::UnsupportedFormat
        | FailureKind::SourceMissing => false,
    }
}

/// Next action after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job, eligible no earlier than now + delay.
    RetryAfter(Duration),
    /// Stop; the job is failed for good.
    Terminal,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum execution attempts per job.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Multiplier applied per subsequent failure (values below 1.0 are
    /// treated as 1.0).
    pub factor: f64,
    /// Cap on the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the processing settings section.
    pub fn from_settings(processing: &ProcessingConfig) -> Self {
        Self {
            max_attempts: processing.retry_attempts.max(1),
            base_delay: Duration::from_secs_f64(processing.retry_base_delay_secs.max(0.0)),
            factor: processing.retry_backoff_factor,
            max_delay: Duration::from_secs_f64(processing.retry_max_delay_secs.max(0.0)),
        }
    }

    /// Decide what happens after the `attempt`-th failure (1-based).
    pub fn next(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !is_retryable(kind) {
            return RetryDecision::Terminal;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Terminal;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }

    /// Delay before the attempt following the `attempt`-th failure:
    /// `base × factor^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = self.factor.max(1.0);
        let secs = self.base_delay.as_secs_f64() * factor.powi(exponent as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}
