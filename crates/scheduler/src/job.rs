//! Job data model for the conversion queue.
//!
//! A [`JobSpec`] is the immutable description of one requested conversion,
//! created at enqueue time. A [`JobRecord`] wraps a spec with the mutable
//! run state the scheduler tracks: status, attempts, progress, timestamps,
//! and the resolved target path.

use crate::executor::FailureKind;
use crate::resolve::OverwritePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Error type for spec validation at enqueue time.
///
/// A spec that fails validation never enters the queue.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Source path is empty
    #[error("Source path is empty")]
    EmptySource,

    /// Target path is empty
    #[error("Target path is empty")]
    EmptyTarget,

    /// Target path equals the source path
    #[error("Target path equals the source path: {0}")]
    TargetIsSource(PathBuf),

    /// Trim range is not a valid forward interval
    #[error("Invalid trim range: start {start}s, end {end}s")]
    InvalidTrim { start: f64, end: f64 },

    /// Numeric conversion parameter is out of range
    #[error("Invalid conversion parameters: {0}")]
    InvalidParams(String),

    /// No free numbered variant of the target path was found
    #[error("Could not generate a unique name for {0}")]
    UniqueNamesExhausted(PathBuf),
}

/// Output audio format.
///
/// A closed enumeration; the codec and file extension are derived from the
/// variant rather than configured separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Mp3,
    Wav,
    M4a,
    Flac,
    Aac,
    Ogg,
}

impl OutputFormat {
    /// FFmpeg encoder name for this format.
    pub fn codec(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "libmp3lame",
            OutputFormat::Wav => "pcm_s16le",
            OutputFormat::M4a => "aac",
            OutputFormat::Flac => "flac",
            OutputFormat::Aac => "aac",
            OutputFormat::Ogg => "libvorbis",
        }
    }

    /// File extension (without dot) for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
            OutputFormat::M4a => "m4a",
            OutputFormat::Flac => "flac",
            OutputFormat::Aac => "aac",
            OutputFormat::Ogg => "ogg",
        }
    }

    /// Parse a format from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "mp3" => Some(OutputFormat::Mp3),
            "wav" => Some(OutputFormat::Wav),
            "m4a" => Some(OutputFormat::M4a),
            "flac" => Some(OutputFormat::Flac),
            "aac" => Some(OutputFormat::Aac),
            "ogg" => Some(OutputFormat::Ogg),
            _ => None,
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Mp3
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Loudness handling applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Leave the original volume untouched.
    Off,
    /// EBU R128 loudness normalization.
    Loudness,
    /// Peak normalization to a target level in dBFS.
    Peak { target_db: f32 },
}

impl Default for NormalizationMode {
    fn default() -> Self {
        Self::Off
    }
}

/// Optional start/end trim applied to the source, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimRange {
    /// Offset into the source where conversion starts.
    pub start_secs: f64,
    /// Absolute position where conversion stops (None = end of source).
    pub end_secs: Option<f64>,
}

impl TrimRange {
    /// A range is valid when the start is non-negative and any end lies
    /// strictly after it.
    pub fn is_valid(&self) -> bool {
        if self.start_secs < 0.0 {
            return false;
        }
        match self.end_secs {
            Some(end) => end > self.start_secs,
            None => true,
        }
    }
}

/// Encoding parameters for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    /// Output format (determines codec and extension).
    pub format: OutputFormat,
    /// Audio bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u8,
    /// Optional trim range.
    #[serde(default)]
    pub trim: Option<TrimRange>,
    /// Audio stream to select (None = first audio stream).
    #[serde(default)]
    pub stream_index: Option<u32>,
    /// Volume normalization.
    #[serde(default)]
    pub normalization: NormalizationMode,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            format: OutputFormat::Mp3,
            bitrate_kbps: 192,
            sample_rate: 44_100,
            channels: 2,
            trim: None,
            stream_index: None,
            normalization: NormalizationMode::Off,
        }
    }
}

/// Immutable description of one requested conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier (UUID).
    pub id: String,
    /// Path to the source media file.
    pub source: PathBuf,
    /// Requested target path, before overwrite resolution.
    pub target: PathBuf,
    /// Encoding parameters.
    pub params: ConversionParams,
    /// Per-job overwrite policy override (None = scheduler default).
    #[serde(default)]
    pub overwrite: Option<OverwritePolicy>,
}

impl JobSpec {
    /// Create a spec with a generated id.
    pub fn new(source: PathBuf, target: PathBuf, params: ConversionParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            target,
            params,
            overwrite: None,
        }
    }

    /// Set a per-job overwrite policy override.
    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = Some(policy);
        self
    }

    /// Validate the spec before admission.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.as_os_str().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if self.target.as_os_str().is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        if self.target == self.source {
            return Err(ValidationError::TargetIsSource(self.target.clone()));
        }
        if let Some(trim) = &self.params.trim {
            if !trim.is_valid() {
                return Err(ValidationError::InvalidTrim {
                    start: trim.start_secs,
                    end: trim.end_secs.unwrap_or(f64::NAN),
                });
            }
        }
        if self.params.bitrate_kbps == 0 {
            return Err(ValidationError::InvalidParams("bitrate is zero".into()));
        }
        if self.params.sample_rate == 0 {
            return Err(ValidationError::InvalidParams("sample rate is zero".into()));
        }
        if self.params.channels == 0 {
            return Err(ValidationError::InvalidParams("channel count is zero".into()));
        }
        Ok(())
    }
}

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot (possibly gated by a retry delay).
    Queued,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with attempts exhausted or a non-retryable error.
    Failed,
    /// Never dispatched because the target existed under the skip policy.
    Skipped,
    /// Cancelled by request.
    Cancelled,
}

impl JobStatus {
    /// Whether no further automatic transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Mutable run state for one job, owned by the scheduler.
///
/// Workers never touch a record directly; they return outcomes that the
/// scheduler applies under its own lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The immutable request.
    pub spec: JobSpec,
    /// Current status.
    pub status: JobStatus,
    /// Number of failed execution attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Progress fraction in [0.0, 1.0].
    #[serde(default)]
    pub progress: f32,
    /// Classification of the last failure, if any.
    #[serde(default)]
    pub error_kind: Option<FailureKind>,
    /// Human-readable message for the last failure or skip.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Target path after overwrite resolution. Computed once before the
    /// first attempt and stable across retries.
    pub resolved_target: PathBuf,
    /// Set when cancellation has been requested for a running job.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Unix timestamp (milliseconds) when the job was enqueued.
    pub created_at_ms: i64,
    /// Unix timestamp (milliseconds) when the latest attempt started.
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    /// Unix timestamp (milliseconds) when the job reached a terminal state.
    #[serde(default)]
    pub finished_at_ms: Option<i64>,
    /// Earliest dispatch time for a retried job (milliseconds).
    #[serde(default)]
    pub not_before_ms: Option<i64>,
}

impl JobRecord {
    /// Create a queued record for a resolved spec.
    pub fn new(spec: JobSpec, resolved_target: PathBuf) -> Self {
        Self {
            spec,
            status: JobStatus::Queued,
            attempts: 0,
            progress: 0.0,
            error_kind: None,
            error_message: None,
            resolved_target,
            cancel_requested: false,
            created_at_ms: current_timestamp_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            not_before_ms: None,
        }
    }

    /// Create a record that was skipped at resolution time.
    pub fn skipped(spec: JobSpec, resolved_target: PathBuf, message: String) -> Self {
        let now = current_timestamp_ms();
        Self {
            spec,
            status: JobStatus::Skipped,
            attempts: 0,
            progress: 0.0,
            error_kind: None,
            error_message: Some(message),
            resolved_target,
            cancel_requested: false,
            created_at_ms: now,
            started_at_ms: None,
            finished_at_ms: Some(now),
            not_before_ms: None,
        }
    }

    /// Whether the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job may still be dispatched or is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Running)
    }

    /// Seconds the latest attempt has been (or was) running.
    pub fn duration_secs(&self, now_ms: i64) -> f64 {
        match self.started_at_ms {
            Some(start) => {
                let end = self.finished_at_ms.unwrap_or(now_ms);
                ((end - start).max(0)) as f64 / 1000.0
            }
            None => 0.0,
        }
    }

    /// Estimated seconds remaining, derived from elapsed time and progress.
    ///
    /// Returns None unless the job is running with measurable progress.
    pub fn eta_secs(&self, now_ms: i64) -> Option<f64> {
        if self.status != JobStatus::Running || self.progress <= 0.0 {
            return None;
        }
        let elapsed = self.duration_secs(now_ms);
        if elapsed <= 0.0 {
            return None;
        }
        let estimated_total = elapsed / self.progress as f64;
        Some((estimated_total - elapsed).max(0.0))
    }
}

/// Build the conventional target path for a source file: the source stem
/// plus the format extension, placed in `output_dir` or next to the source.
pub fn default_target_for(source: &Path, output_dir: Option<&Path>, format: OutputFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("converted_file");
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(format!("{}.{}", stem, format.extension()))
}

/// Current timestamp in milliseconds since the Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
