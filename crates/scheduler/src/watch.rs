//! Watch-folder bridge.
//!
//! Watches configured directories for new media files and enqueues them
//! with the default conversion settings. A file is only enqueued once its
//! size/metadata events go quiet for the settle window, so half-copied
//! files are never handed to the engine.

use crate::job::{default_target_for, ConversionParams, JobSpec};
use crate::resolve::OverwritePolicy;
use crate::scheduler::Scheduler;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the settle sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Running watch-folder bridge.
///
/// Dropping (or stopping) the bridge stops the watcher and the sweep task;
/// jobs already enqueued are unaffected.
pub struct WatchBridge {
    // Held to keep the OS watches registered.
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
}

impl WatchBridge {
    /// Start watching. Returns None when watching is disabled or no paths
    /// are configured.
    pub fn start(
        scheduler: Scheduler,
        watch: &vid2aud_config::WatchConfig,
        defaults: ConversionParams,
        output_dir: Option<PathBuf>,
        overwrite: Option<OverwritePolicy>,
    ) -> notify::Result<Option<Self>> {
        if !watch.enabled || watch.paths.is_empty() {
            info!("watch folders disabled or none configured");
            return Ok(None);
        }

        let settle = Duration::from_secs(watch.settle_secs);
        let extensions: Vec<String> = watch.extensions.iter().map(|e| e.to_lowercase()).collect();

        // Files that have appeared but may still be mid-write
        // (path -> last event time).
        let pending: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

        let pending_writer = pending.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        let mut map = pending_writer.lock();
                        for path in event.paths {
                            map.insert(path, Instant::now());
                        }
                    }
                }
            },
        )?;

        for path in &watch.paths {
            if path.exists() {
                match watcher.watch(path, RecursiveMode::Recursive) {
                    Ok(()) => info!(path = %path.display(), "watching directory"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to watch"),
                }
            } else {
                warn!(path = %path.display(), "watch path does not exist");
            }
        }

        let cancel = CancellationToken::new();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = sweep_cancel.cancelled() => break,
                }

                let settled = drain_settled(&mut pending.lock(), Instant::now(), settle);
                for path in settled {
                    if !has_allowed_extension(&path, &extensions) || !path.is_file() {
                        continue;
                    }
                    let spec = build_watch_spec(
                        &path,
                        defaults.clone(),
                        output_dir.as_deref(),
                        overwrite,
                    );
                    match scheduler.enqueue(spec) {
                        Ok(job_id) => {
                            debug!(job_id = %job_id, path = %path.display(), "enqueued watched file")
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "rejected watched file"),
                    }
                }
            }
        });

        Ok(Some(Self {
            _watcher: watcher,
            cancel,
        }))
    }

    /// Stop watching.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Remove and return the paths whose last event is at least `settle` old.
fn drain_settled(
    pending: &mut HashMap<PathBuf, Instant>,
    now: Instant,
    settle: Duration,
) -> Vec<PathBuf> {
    let mut settled = Vec::new();
    pending.retain(|path, last_seen| {
        if now.duration_since(*last_seen) >= settle {
            settled.push(path.clone());
            false
        } else {
            true
        }
    });
    settled
}

/// Case-insensitive extension filter.
fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            extensions.iter().any(|allowed| *allowed == lower)
        })
        .unwrap_or(false)
}

/// Spec for a watched file: default parameters, conventional target path.
fn build_watch_spec(
    source: &Path,
    defaults: ConversionParams,
    output_dir: Option<&Path>,
    overwrite: Option<OverwritePolicy>,
) -> JobSpec {
    let target = default_target_for(source, output_dir, defaults.format);
    let mut spec = JobSpec::new(source.to_path_buf(), target, defaults);
    spec.overwrite = overwrite;
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::OutputFormat;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extension_filter() {
        let allowed = exts(&["mkv", "mp4"]);
        assert!(has_allowed_extension(Path::new("/in/a.mkv"), &allowed));
        assert!(has_allowed_extension(Path::new("/in/a.MKV"), &allowed));
        assert!(has_allowed_extension(Path::new("/in/b.mp4"), &allowed));
        assert!(!has_allowed_extension(Path::new("/in/c.srt"), &allowed));
        assert!(!has_allowed_extension(Path::new("/in/noext"), &allowed));
    }

    #[test]
    fn test_drain_settled_splits_by_age() {
        let now = Instant::now();
        let settle = Duration::from_secs(10);
        let mut pending = HashMap::new();
        pending.insert(PathBuf::from("/in/old.mkv"), now - Duration::from_secs(15));
        pending.insert(PathBuf::from("/in/fresh.mkv"), now - Duration::from_secs(2));

        let settled = drain_settled(&mut pending, now, settle);

        assert_eq!(settled, vec![PathBuf::from("/in/old.mkv")]);
        assert!(pending.contains_key(Path::new("/in/fresh.mkv")));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_build_watch_spec_defaults() {
        let mut defaults = ConversionParams::default();
        defaults.format = OutputFormat::Ogg;

        let spec = build_watch_spec(
            Path::new("/incoming/show.mkv"),
            defaults,
            Some(Path::new("/library/audio")),
            Some(OverwritePolicy::Skip),
        );

        assert_eq!(spec.source, PathBuf::from("/incoming/show.mkv"));
        assert_eq!(spec.target, PathBuf::from("/library/audio/show.ogg"));
        assert_eq!(spec.overwrite, Some(OverwritePolicy::Skip));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_build_watch_spec_without_output_dir() {
        let spec = build_watch_spec(
            Path::new("/incoming/show.mkv"),
            ConversionParams::default(),
            None,
            None,
        );
        assert_eq!(spec.target, PathBuf::from("/incoming/show.mp3"));
        assert!(spec.overwrite.is_none());
    }
}
