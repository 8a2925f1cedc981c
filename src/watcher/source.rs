//! The watch-source capability shared by the push, poll and runs watchers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{Settings, WatchMode};
use crate::identity::IdentityExtractor;

use super::error::WatchError;
use super::poll::PollWatcher;
use super::push::PushWatcher;
use super::runs::{RunsOptions, RunsWatcher};
use super::stability::StabilityDetector;

/// A file that appeared and passed the stability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A producer of [`WatchEvent`]s.
///
/// Each implementation sends its events on the channel it was built with.
/// Adding a path that is already watched is a no-op.
#[async_trait]
pub trait WatchSource: Send {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Start watching `path` in the background.
    fn add_watch(&mut self, path: &Path) -> Result<(), WatchError>;

    /// Paths currently watched.
    fn watched(&self) -> Vec<PathBuf>;

    /// Signal every background task to stop and wait until they have exited.
    async fn close(&mut self);
}

/// Build the watch source selected by `settings.watcher.mode`.
pub fn build_source(
    settings: &Settings,
    extractor: Arc<IdentityExtractor>,
    events: mpsc::Sender<WatchEvent>,
) -> Result<Box<dyn WatchSource>, WatchError> {
    let watcher = &settings.watcher;
    let detector = StabilityDetector::new(watcher.quiescence());

    let source: Box<dyn WatchSource> = match watcher.mode {
        WatchMode::Push => Box::new(PushWatcher::new(detector, watcher.debounce_ms, events)?),
        WatchMode::Poll => Box::new(PollWatcher::new(
            detector,
            watcher.period(),
            watcher.scan_existing,
            events,
        )),
        WatchMode::Runs => Box::new(RunsWatcher::new(
            RunsOptions {
                period: watcher.period(),
                subdirectory: watcher.subdirectory.clone(),
                run_prefix: watcher.run_prefix.clone(),
                scan_existing: watcher.scan_existing,
                wanted_types: extractor
                    .required_types()
                    .into_iter()
                    .chain(settings.require_ancillary_flags.values().cloned())
                    .collect(),
            },
            detector,
            extractor,
            events,
        )),
    };
    Ok(source)
}
