//! vid2aud scheduler
//!
//! Job queue and worker-pool core for batch media conversion. Turns a list
//! of conversion requests into a controlled, observable, recoverable
//! execution stream around an external transcoding engine: FIFO dispatch
//! under a concurrency limit, table-driven retries with backoff, overwrite
//! resolution, cooperative cancellation, crash-safe session snapshots, and
//! watch-folder enqueueing.

pub mod events;
pub mod executor;
pub mod ffmpeg;
pub mod job;
mod pool;
pub mod resolve;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod watch;

pub use vid2aud_config as config;
pub use vid2aud_config::Settings;

pub use events::{EventBus, QueueEvent, QueueStats};
pub use executor::{FailureKind, Outcome, TranscodeEngine};
pub use ffmpeg::{check_ffmpeg_available, EngineError, FfmpegEngine};
pub use job::{
    default_target_for, ConversionParams, JobRecord, JobSpec, JobStatus, NormalizationMode,
    OutputFormat, TrimRange, ValidationError,
};
pub use resolve::{resolve_target, OverwritePolicy, Resolution};
pub use retry::{is_retryable, RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use session::{SessionSnapshot, SessionStore, SCHEMA_VERSION};
pub use watch::WatchBridge;
