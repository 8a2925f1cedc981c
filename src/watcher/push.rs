//! Push-based watch source using OS change notifications.
//!
//! A single `notify::RecommendedWatcher` feeds raw events into a background
//! task. The task keeps write-like events only, debounces them per path, runs
//! one stability check per settled path and emits the paths that proved
//! stable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use super::debouncer::Debouncer;
use super::error::WatchError;
use super::source::{WatchEvent, WatchSource};
use super::stability::StabilityDetector;

pub struct PushWatcher {
    /// Dropped on close, releasing the OS subscription.
    watcher: Option<notify::RecommendedWatcher>,
    watched: HashSet<PathBuf>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PushWatcher {
    /// Create the OS watcher and start the event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        detector: StabilityDetector,
        debounce_ms: u64,
        events: mpsc::Sender<WatchEvent>,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel(256);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        })?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            rx,
            Debouncer::new(debounce_ms),
            detector,
            events,
            shutdown.child_token(),
        ));

        Ok(Self {
            watcher: Some(watcher),
            watched: HashSet::new(),
            shutdown,
            task: Some(task),
        })
    }
}

#[async_trait]
impl WatchSource for PushWatcher {
    fn name(&self) -> &str {
        "push"
    }

    fn add_watch(&mut self, path: &Path) -> Result<(), WatchError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatchError::Closed {
                source_name: "push".to_string(),
            });
        };
        if self.watched.contains(path) {
            crate::debug_event!("watcher", "already watching", "{}", path.display());
            return Ok(());
        }

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        self.watched.insert(path.to_path_buf());

        crate::log_event!("watcher", "watching", "{}", path.display());
        Ok(())
    }

    fn watched(&self) -> Vec<PathBuf> {
        self.watched.iter().cloned().collect()
    }

    async fn close(&mut self) {
        self.shutdown.cancel();
        // Dropping the notify watcher unsubscribes every path
        self.watcher = None;
        self.watched.clear();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("[watcher] event loop failed: {e}");
            }
        }
        crate::log_event!("watcher", "closed");
    }
}

/// Whether a notification means file content was (or may have been) written.
fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(
                ModifyKind::Data(_)
                    | ModifyKind::Any
                    | ModifyKind::Name(RenameMode::To | RenameMode::Both | RenameMode::Any)
            )
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

async fn run_event_loop(
    mut rx: mpsc::Receiver<notify::Result<Event>>,
    mut debouncer: Debouncer,
    detector: StabilityDetector,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let mut checks: JoinSet<(PathBuf, bool)> = JoinSet::new();
    let mut in_flight: HashSet<PathBuf> = HashSet::new();

    crate::log_event!("watcher", "started");

    loop {
        let timeout = sleep(Duration::from_millis(100));
        tokio::pin!(timeout);

        tokio::select! {
            _ = cancel.cancelled() => break,

            received = rx.recv() => match received {
                Some(Ok(event)) => {
                    match event.kind {
                        EventKind::Remove(_) => {
                            for path in &event.paths {
                                debouncer.forget(path);
                            }
                        }
                        ref kind if is_write_event(kind) => {
                            for path in event.paths {
                                debouncer.record(path);
                            }
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => tracing::error!("[watcher] file watch error: {e}"),
                None => break,
            },

            _ = &mut timeout => {
                for path in debouncer.take_ready() {
                    if in_flight.contains(&path) {
                        // A check is already running; look again after it
                        debouncer.record(path);
                        continue;
                    }
                    in_flight.insert(path.clone());
                    checks.spawn(async move {
                        let stable = detector.is_stable(&path).await;
                        (path, stable)
                    });
                }
            }

            Some(joined) = checks.join_next() => match joined {
                Ok((path, true)) => {
                    in_flight.remove(&path);
                    crate::debug_event!("watcher", "stable", "{}", path.display());
                    if events.send(WatchEvent::new(path)).await.is_err() {
                        tracing::warn!("[watcher] event queue closed, stopping");
                        break;
                    }
                }
                Ok((path, false)) => {
                    in_flight.remove(&path);
                    if path.exists() {
                        debouncer.record(path);
                    }
                }
                Err(e) => tracing::error!("[watcher] stability check task failed: {e}"),
            },
        }
    }

    // Checks in progress are short; let them finish but drop their results.
    while checks.join_next().await.is_some() {}
    crate::debug_event!("watcher", "stopped");
}
