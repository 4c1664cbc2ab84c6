//! CLI entry point for the vid2aud batch converter.
//!
//! Loads settings, checks that ffmpeg is usable, restores any interrupted
//! session, enqueues the requested files, and runs the queue until it
//! drains (or indefinitely in watch mode), printing job transitions as
//! they happen.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vid2aud_config::Settings;
use vid2aud_scheduler::{
    check_ffmpeg_available, default_target_for, ConversionParams, FfmpegEngine, JobSpec,
    NormalizationMode, OutputFormat, OverwritePolicy, QueueEvent, Scheduler, SchedulerConfig,
    SessionStore, WatchBridge,
};

/// vid2aud - batch-extract audio from video files with FFmpeg
#[derive(Parser, Debug)]
#[command(name = "vid2aud")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files to convert
    inputs: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "vid2aud.toml")]
    config: PathBuf,

    /// Output directory (default: next to each source file)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Output format: mp3, wav, m4a, flac, aac, ogg
    #[arg(short, long)]
    format: Option<String>,

    /// Audio bitrate in kbit/s
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Worker slot count (1-16)
    #[arg(short = 'j', long)]
    concurrency: Option<u32>,

    /// Overwrite policy: skip, replace, unique
    #[arg(long)]
    overwrite: Option<String>,

    /// Keep running and convert files appearing in the configured watch folders
    #[arg(short, long, default_value = "false")]
    watch: bool,

    /// Skip the ffmpeg availability check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut settings = if args.config.exists() {
        match Settings::load(&args.config) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Failed to load {}: {e}", args.config.display());
                return ExitCode::FAILURE;
            }
        }
    } else {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings
    };

    // Command-line flags win over the settings file.
    if let Some(dir) = &args.output_dir {
        settings.paths.output_dir = Some(dir.clone());
    }
    if let Some(format) = &args.format {
        settings.conversion.format = format.clone();
    }
    if let Some(bitrate) = args.bitrate {
        settings.conversion.bitrate_kbps = bitrate;
    }
    if let Some(concurrency) = args.concurrency {
        settings.processing.max_concurrent_jobs = concurrency;
    }
    if let Some(policy) = &args.overwrite {
        if OverwritePolicy::from_name(policy).is_none() {
            eprintln!("Unknown overwrite policy '{policy}' (expected skip, replace, or unique)");
            return ExitCode::FAILURE;
        }
        settings.processing.overwrite_policy = policy.to_lowercase();
    }
    if args.watch {
        settings.watch.enabled = true;
    }

    if args.inputs.is_empty() && !settings.watch.enabled {
        eprintln!("Nothing to do: no input files and watch folders are disabled");
        return ExitCode::FAILURE;
    }

    let Some(format) = OutputFormat::from_name(&settings.conversion.format) else {
        eprintln!(
            "Unknown output format '{}' (expected mp3, wav, m4a, flac, aac, or ogg)",
            settings.conversion.format
        );
        return ExitCode::FAILURE;
    };
    let params = build_params(&settings, format);

    let engine = FfmpegEngine::new(settings.paths.ffmpeg_path.clone());
    if !args.skip_checks {
        if let Err(e) = check_ffmpeg_available(engine.ffmpeg_path()).await {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let store = settings
        .paths
        .state_dir
        .as_deref()
        .map(SessionStore::in_dir);

    let scheduler = Scheduler::new(
        std::sync::Arc::new(engine),
        SchedulerConfig::from_settings(&settings),
        store,
    );

    match scheduler.restore() {
        Ok(0) => {}
        Ok(restored) => info!(restored, "re-queued jobs from interrupted session"),
        Err(e) => warn!(error = %e, "could not restore previous session"),
    }

    let output_dir = settings.paths.output_dir.clone();
    let mut enqueued = 0usize;
    for input in &args.inputs {
        let target = default_target_for(input, output_dir.as_deref(), format);
        let spec = JobSpec::new(input.clone(), target, params.clone());
        match scheduler.enqueue(spec) {
            Ok(_) => enqueued += 1,
            Err(e) => eprintln!("Rejected {}: {e}", input.display()),
        }
    }
    info!(enqueued, "jobs enqueued");

    let mut events = scheduler.subscribe();
    scheduler.start();

    let _bridge = match WatchBridge::start(
        scheduler.clone(),
        &settings.watch,
        params,
        output_dir,
        OverwritePolicy::from_name(&settings.processing.overwrite_policy),
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Failed to start watch folders: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Skipped-at-enqueue or rejected inputs may leave nothing to run at all.
    let stats = scheduler.stats();
    if !settings.watch.enabled && stats.is_drained() {
        println!(
            "Done: {} completed, {} failed, {} cancelled, {} skipped",
            stats.completed, stats.failed, stats.cancelled, stats.skipped
        );
        scheduler.shutdown();
        return if stats.failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(QueueEvent::StatusChanged { job_id, new_status, message, .. }) => {
                    match message {
                        Some(message) => println!("[{new_status}] {job_id}: {message}"),
                        None => println!("[{new_status}] {job_id}"),
                    }
                }
                Ok(QueueEvent::Progress { .. }) => {}
                Ok(QueueEvent::QueueDrained { stats, .. }) => {
                    println!(
                        "Done: {} completed, {} failed, {} cancelled, {} skipped",
                        stats.completed, stats.failed, stats.cancelled, stats.skipped
                    );
                    failed = stats.failed;
                    if !settings.watch.enabled {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "event stream interrupted");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted; queued jobs will resume next run");
                scheduler.pause();
                scheduler.shutdown();
                return ExitCode::FAILURE;
            }
        }
    }

    scheduler.shutdown();
    if failed == 0 {
        if let Err(e) = scheduler.clear_session() {
            warn!(error = %e, "could not clear session snapshot");
        }
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Conversion parameters from the settings file defaults.
fn build_params(settings: &Settings, format: OutputFormat) -> ConversionParams {
    let normalization = match settings.conversion.normalization.to_lowercase().as_str() {
        "loudness" => NormalizationMode::Loudness,
        "peak" => NormalizationMode::Peak {
            target_db: settings.conversion.peak_target_db,
        },
        _ => NormalizationMode::Off,
    };
    ConversionParams {
        format,
        bitrate_kbps: settings.conversion.bitrate_kbps,
        sample_rate: settings.conversion.sample_rate,
        channels: settings.conversion.channels,
        trim: None,
        stream_index: None,
        normalization,
    }
}
