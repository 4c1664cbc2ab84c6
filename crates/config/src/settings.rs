//! Core settings structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for settings operations
#[derive(Debug)]
pub enum SettingsError {
    /// IO error reading settings file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "Failed to read settings file: {}", e),
            SettingsError::Parse(e) => write!(f, "Failed to parse settings: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<std::io::Error> for SettingsError {
    fn from(e: std::io::Error) -> Self {
        SettingsError::Io(e)
    }
}

impl From<toml::de::Error> for SettingsError {
    fn from(e: toml::de::Error) -> Self {
        SettingsError::Parse(e)
    }
}

/// Default conversion parameters applied to jobs that don't specify their own
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionDefaults {
    /// Output container/format name (mp3, wav, m4a, flac, aac, ogg)
    #[serde(default = "default_format")]
    pub format: String,
    /// Audio bitrate in kbit/s
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Output channel count
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Normalization mode: "none", "loudness", or "peak"
    #[serde(default = "default_normalization")]
    pub normalization: String,
    /// Peak target in dBFS, used when normalization = "peak"
    #[serde(default = "default_peak_target_db")]
    pub peak_target_db: f32,
}

fn default_format() -> String {
    "mp3".to_string()
}

fn default_bitrate_kbps() -> u32 {
    192
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_channels() -> u8 {
    2
}

fn default_normalization() -> String {
    "none".to_string()
}

fn default_peak_target_db() -> f32 {
    -1.0
}

impl Default for ConversionDefaults {
    fn default() -> Self {
        Self {
            format: default_format(),
            bitrate_kbps: default_bitrate_kbps(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            normalization: default_normalization(),
            peak_target_db: default_peak_target_db(),
        }
    }
}

/// Queue and retry behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    /// Maximum concurrent jobs (0 = auto-derive from CPU count, clamped to 1..=16)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Maximum execution attempts per job before it is marked failed
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base retry delay in seconds
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,
    /// Multiplier applied to the delay on each successive attempt
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    /// Upper bound on the retry delay in seconds
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: f64,
    /// Overwrite policy for existing targets: "skip", "replace", or "unique"
    #[serde(default = "default_overwrite_policy")]
    pub overwrite_policy: String,
    /// Maximum runtime per job in seconds (0 = no timeout)
    #[serde(default)]
    pub job_timeout_secs: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> f64 {
    2.0
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_retry_max_delay_secs() -> f64 {
    300.0
}

fn default_overwrite_policy() -> String {
    "unique".to_string()
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            overwrite_policy: default_overwrite_policy(),
            job_timeout_secs: 0,
        }
    }
}

/// Watch-folder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Whether the watch-folder bridge is active
    #[serde(default)]
    pub enabled: bool,
    /// Directories to watch recursively
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Seconds a new file's size must stay unchanged before it is enqueued
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// File extensions (without dot, case-insensitive) accepted by the watcher
    #[serde(default = "default_watch_extensions")]
    pub extensions: Vec<String>,
}

fn default_settle_secs() -> u64 {
    10
}

fn default_watch_extensions() -> Vec<String> {
    ["mp4", "mkv", "mov", "avi", "wmv", "flv", "webm", "m4v", "3gp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            settle_secs: default_settle_secs(),
            extensions: default_watch_extensions(),
        }
    }
}

/// File and directory paths
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PathsConfig {
    /// Output directory for converted files (None = next to the source file)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Explicit path to the ffmpeg binary (None = resolve from PATH)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    /// Directory for the session snapshot (None = no persistence)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub conversion: ConversionDefaults,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Settings {
    /// Load settings from a TOML file
    ///
    /// Missing optional fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse settings from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Apply environment variable overrides to the settings
    ///
    /// Overrides the following values if environment variables are set:
    /// - VID2AUD_MAX_CONCURRENT_JOBS -> processing.max_concurrent_jobs
    /// - VID2AUD_RETRY_ATTEMPTS -> processing.retry_attempts
    /// - VID2AUD_OVERWRITE_POLICY -> processing.overwrite_policy
    /// - VID2AUD_JOB_TIMEOUT_SECS -> processing.job_timeout_secs
    /// - VID2AUD_OUTPUT_DIR -> paths.output_dir
    /// - VID2AUD_FFMPEG_PATH -> paths.ffmpeg_path
    /// - VID2AUD_STATE_DIR -> paths.state_dir
    /// - VID2AUD_WATCH_ENABLED -> watch.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VID2AUD_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.processing.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("VID2AUD_RETRY_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.processing.retry_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("VID2AUD_OVERWRITE_POLICY") {
            match val.to_lowercase().as_str() {
                policy @ ("skip" | "replace" | "unique") => {
                    self.processing.overwrite_policy = policy.to_string();
                }
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("VID2AUD_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.processing.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("VID2AUD_OUTPUT_DIR") {
            if !val.is_empty() {
                self.paths.output_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VID2AUD_FFMPEG_PATH") {
            if !val.is_empty() {
                self.paths.ffmpeg_path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VID2AUD_STATE_DIR") {
            if !val.is_empty() {
                self.paths.state_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VID2AUD_WATCH_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.watch.enabled = true,
                "false" | "0" | "no" => self.watch.enabled = false,
                _ => {}
            }
        }
    }

    /// Load settings from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let mut settings = Self::load_from_file(path)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Effective worker slot count
    ///
    /// An explicit non-zero value is clamped to 1..=16. Zero auto-derives
    /// from the CPU count.
    pub fn effective_concurrency(&self) -> u32 {
        if self.processing.max_concurrent_jobs > 0 {
            clamp_concurrency(self.processing.max_concurrent_jobs)
        } else {
            derive_concurrency(num_cpus::get() as u32)
        }
    }
}

/// Clamp an explicit concurrency value to the supported 1..=16 range
pub fn clamp_concurrency(requested: u32) -> u32 {
    requested.clamp(1, 16)
}

/// Derive a concurrency default from the CPU count
///
/// One slot per core, capped at 4. External encodes are CPU-bound, so
/// running more jobs than cores only thrashes.
pub fn derive_concurrency(cores: u32) -> u32 {
    cores.clamp(1, 4)
}
