//! Poll-based watch source.
//!
//! Each watched directory gets its own background task that lists the
//! directory every period and emits files that are new since the previous pass
//! and stable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::scan::{DirectoryScan, EntryKind};
use super::source::{WatchEvent, WatchSource};
use super::stability::StabilityDetector;

pub struct PollWatcher {
    detector: StabilityDetector,
    period: Duration,
    scan_existing: bool,
    events: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
    tasks: HashMap<PathBuf, JoinHandle<()>>,
}

impl PollWatcher {
    /// Create a poll watcher. With `scan_existing`, files already present when
    /// a watch starts are emitted on its first pass.
    pub fn new(
        detector: StabilityDetector,
        period: Duration,
        scan_existing: bool,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        Self {
            detector,
            period,
            scan_existing,
            events,
            shutdown: CancellationToken::new(),
            tasks: HashMap::new(),
        }
    }
}

#[async_trait]
impl WatchSource for PollWatcher {
    fn name(&self) -> &str {
        "poll"
    }

    fn add_watch(&mut self, path: &Path) -> Result<(), WatchError> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::Closed {
                source_name: self.name().to_string(),
            });
        }
        if self.tasks.contains_key(path) {
            crate::debug_event!("poll", "already watching", "{}", path.display());
            return Ok(());
        }

        let since = if self.scan_existing {
            SystemTime::UNIX_EPOCH
        } else {
            SystemTime::now()
        };
        let task = tokio::spawn(poll_directory(
            path.to_path_buf(),
            DirectoryScan::new(EntryKind::Files, since),
            self.detector,
            self.period,
            self.events.clone(),
            self.shutdown.child_token(),
        ));
        self.tasks.insert(path.to_path_buf(), task);

        crate::log_event!(
            "poll",
            "watching",
            "{} every {}s",
            path.display(),
            self.period.as_secs_f32()
        );
        Ok(())
    }

    fn watched(&self) -> Vec<PathBuf> {
        self.tasks.keys().cloned().collect()
    }

    async fn close(&mut self) {
        self.shutdown.cancel();
        for (path, task) in self.tasks.drain() {
            if let Err(e) = task.await {
                tracing::error!("[poll] watch task for {} failed: {e}", path.display());
            }
        }
        crate::log_event!("poll", "closed");
    }
}

/// Poll `dir` until cancelled or until the event receiver is gone.
pub(crate) async fn poll_directory(
    dir: PathBuf,
    mut scan: DirectoryScan,
    detector: StabilityDetector,
    period: Duration,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stable = tokio::select! {
            _ = cancel.cancelled() => break,
            result = scan.stable_files(&dir, detector) => result,
        };

        match stable {
            Ok(paths) => {
                for path in paths {
                    crate::debug_event!("poll", "stable", "{}", path.display());
                    if events.send(WatchEvent::new(path)).await.is_err() {
                        tracing::warn!("[poll] event queue closed, stopping {}", dir.display());
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[poll] failed to list {}: {e}", dir.display());
            }
        }
    }

    crate::debug_event!("poll", "stopped", "{}", dir.display());
}
