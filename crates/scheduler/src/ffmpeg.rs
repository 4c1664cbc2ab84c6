//! FFmpeg-backed transcoding engine.
//!
//! Adapts one job into an ffmpeg invocation: builds the argument list from
//! the conversion parameters, probes the source duration with ffprobe so
//! progress can be reported as a fraction, streams ffmpeg's machine-
//! readable `-progress` output, and classifies failures for the retry
//! policy. Cancellation is cooperative: the token is polled between
//! progress lines and the child is killed when it fires.

use crate::executor::{FailureKind, Outcome, TranscodeEngine};
use crate::job::{JobSpec, NormalizationMode, OutputFormat};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of trailing stderr lines included in failure messages.
const STDERR_TAIL_LINES: usize = 10;

/// Error type for engine availability checks.
#[derive(Debug, Error)]
pub enum EngineError {
    /// ffmpeg could not be executed
    #[error("ffmpeg not available at '{path}': {reason}")]
    FfmpegUnavailable { path: PathBuf, reason: String },
}

/// Verify that ffmpeg runs at all (`ffmpeg -version` exits zero).
pub async fn check_ffmpeg_available(ffmpeg_path: &Path) -> Result<(), EngineError> {
    let status = Command::new(ffmpeg_path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(EngineError::FfmpegUnavailable {
            path: ffmpeg_path.to_path_buf(),
            reason: format!("exit status {status}"),
        }),
        Err(e) => Err(EngineError::FfmpegUnavailable {
            path: ffmpeg_path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// The concrete engine used in production.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegEngine {
    /// Engine using an explicit ffmpeg path, or plain `ffmpeg` from PATH.
    pub fn new(ffmpeg_path: Option<PathBuf>) -> Self {
        let ffmpeg_path = ffmpeg_path.unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe_path = derive_ffprobe_path(&ffmpeg_path);
        Self {
            ffmpeg_path,
            ffprobe_path,
        }
    }

    /// Path the engine will invoke.
    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// Source duration in seconds via ffprobe, or None if probing fails.
    ///
    /// Without a duration the conversion still runs; it just reports no
    /// intermediate progress.
    async fn probe_duration_secs(&self, source: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(source)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            debug!(source = %source.display(), "ffprobe exited non-zero");
            return None;
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        value
            .get("format")?
            .get("duration")?
            .as_str()?
            .parse::<f64>()
            .ok()
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn execute(
        &self,
        spec: &JobSpec,
        target: &Path,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Outcome {
        if !spec.source.exists() {
            return Outcome::failure(
                FailureKind::SourceMissing,
                format!("Source file not found: {}", spec.source.display()),
            );
        }

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Outcome::failure(
                    classify_io(&e),
                    format!("Failed to create output directory {}: {e}", parent.display()),
                );
            }
        }

        let duration = effective_duration_secs(spec, self.probe_duration_secs(&spec.source).await);

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(build_ffmpeg_args(spec, target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(source = %spec.source.display(), target = %target.display(), "starting ffmpeg");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Outcome::failure(
                    FailureKind::EngineNotFound,
                    format!("ffmpeg not found at '{}'", self.ffmpeg_path.display()),
                );
            }
            Err(e) => {
                return Outcome::failure(FailureKind::Io, format!("Failed to start ffmpeg: {e}"));
            }
        };

        // Collect stderr in the background; only the tail ends up in
        // failure messages.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        // Stream progress key=value lines from stdout, watching the token
        // between lines.
        let stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines());
        if let Some(mut lines) = stdout {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        stderr_task.abort();
                        return Outcome::Cancelled;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let (Some(position), Some(total)) =
                                (parse_progress_line(&line), duration)
                            {
                                if total > 0.0 {
                                    progress((position / total) as f32);
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Outcome::Cancelled;
            }
            status = child.wait() => status,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => {
                if target.exists() {
                    progress(1.0);
                    Outcome::Success
                } else {
                    Outcome::failure(
                        FailureKind::OutputMissing,
                        format!("ffmpeg succeeded but produced no output at {}", target.display()),
                    )
                }
            }
            Ok(status) => {
                let tail = stderr_tail(&stderr_text);
                let kind = classify_exit(status.code(), &tail);
                warn!(code = ?status.code(), %kind, "ffmpeg failed");
                let message = match status.code() {
                    Some(code) => format!("ffmpeg exited with code {code}: {tail}"),
                    None => format!("ffmpeg terminated by signal: {tail}"),
                };
                Outcome::failure(kind, message)
            }
            Err(e) => Outcome::failure(FailureKind::Io, format!("Failed to wait for ffmpeg: {e}")),
        }
    }
}

/// Derive the ffprobe path from the ffmpeg path, preserving any directory
/// and `.exe` suffix. Falls back to `ffprobe` from PATH.
fn derive_ffprobe_path(ffmpeg: &Path) -> PathBuf {
    match ffmpeg.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.contains("ffmpeg") => {
            let probe_name = name.replace("ffmpeg", "ffprobe");
            match ffmpeg.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.join(probe_name),
                _ => PathBuf::from(probe_name),
            }
        }
        _ => PathBuf::from("ffprobe"),
    }
}

/// Build the full ffmpeg argument list for one job.
pub fn build_ffmpeg_args(spec: &JobSpec, target: &Path) -> Vec<OsString> {
    let params = &spec.params;
    let mut args: Vec<OsString> = Vec::new();

    args.push("-y".into());
    args.push("-i".into());
    args.push(spec.source.as_os_str().to_owned());

    if let Some(trim) = &params.trim {
        args.push("-ss".into());
        args.push(format_seconds(trim.start_secs).into());
        if let Some(end) = trim.end_secs {
            args.push("-to".into());
            args.push(format_seconds(end).into());
        }
    }

    // Audio stream selection: explicit index or the first audio stream.
    args.push("-map".into());
    args.push(format!("0:a:{}", params.stream_index.unwrap_or(0)).into());

    args.push("-c:a".into());
    args.push(params.format.codec().into());

    // VBR at highest quality for mp3, still honoring the bitrate choice.
    if params.format == OutputFormat::Mp3 {
        args.push("-q:a".into());
        args.push("0".into());
    }
    args.push("-b:a".into());
    args.push(format!("{}k", params.bitrate_kbps).into());

    args.push("-ar".into());
    args.push(params.sample_rate.to_string().into());
    args.push("-ac".into());
    args.push(params.channels.to_string().into());

    match params.normalization {
        NormalizationMode::Off => {}
        NormalizationMode::Loudness => {
            args.push("-af".into());
            args.push("loudnorm=I=-18:LRA=7:TP=-2".into());
        }
        NormalizationMode::Peak { target_db } => {
            args.push("-af".into());
            args.push(format!("volume={target_db}dB").into());
        }
    }

    // Carry source metadata (title, artist, ...) into the output.
    args.push("-map_metadata".into());
    args.push("0".into());

    // Machine-readable progress on stdout instead of the human stats line.
    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push("-nostats".into());

    args.push(target.as_os_str().to_owned());
    args
}

/// Parse one `-progress` line into an output position in seconds.
///
/// ffmpeg reports `out_time_us` (and the historically misnamed
/// `out_time_ms`) in microseconds.
fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        "out_time_us" | "out_time_ms" => {
            let micros: i64 = value.trim().parse().ok()?;
            Some((micros.max(0)) as f64 / 1_000_000.0)
        }
        _ => None,
    }
}

/// Length of the audio actually produced, accounting for trim.
fn effective_duration_secs(spec: &JobSpec, probed: Option<f64>) -> Option<f64> {
    let total = probed?;
    match &spec.params.trim {
        Some(trim) => {
            let end = trim.end_secs.unwrap_or(total).min(total);
            Some((end - trim.start_secs).max(0.0))
        }
        None => Some(total),
    }
}

/// Classify a non-success exit by code and stderr content.
fn classify_exit(code: Option<i32>, stderr_tail: &str) -> FailureKind {
    if code.is_none() {
        return FailureKind::Signal;
    }
    let lower = stderr_tail.to_lowercase();
    if lower.contains("permission denied") {
        FailureKind::PermissionDenied
    } else if lower.contains("unknown encoder")
        || lower.contains("decoder not found")
        || lower.contains("invalid data found")
    {
        FailureKind::UnsupportedFormat
    } else if lower.contains("no such file or directory") {
        FailureKind::SourceMissing
    } else {
        FailureKind::NonZeroExit
    }
}

/// Classify an I/O error from preparing the output location.
fn classify_io(error: &io::Error) -> FailureKind {
    match error.kind() {
        io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
        _ => FailureKind::Io,
    }
}

/// Last few lines of stderr, joined for a failure message.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Seconds formatted the way ffmpeg accepts for -ss/-to.
fn format_seconds(secs: f64) -> String {
    format!("{secs:.3}")
}
