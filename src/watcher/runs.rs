//! Two-level poll watch for a root-of-runs layout.
//!
//! ```text
//! <root>/<run>/<subdirectory>/<file>
//! ```
//!
//! A root task polls `<root>` for new run directories. Every new run gets its
//! own nested poll task on `<root>/<run>/<subdirectory>`. A nested task emits
//! the stable files of wanted types, counts the distinct types it has seen,
//! and stops by itself once all of them have arrived.
//! Nested tasks own their state outright; they share nothing mutable with each
//! other or with the root task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::identity::IdentityExtractor;

use super::error::WatchError;
use super::scan::{DirectoryScan, EntryKind};
use super::source::{WatchEvent, WatchSource};
use super::stability::StabilityDetector;

/// Layout and timing for a runs watch.
#[derive(Debug, Clone)]
pub struct RunsOptions {
    pub period: Duration,
    /// Directory inside each run holding the files
    pub subdirectory: String,
    /// Only runs whose name starts with this prefix are watched
    pub run_prefix: Option<String>,
    /// Also watch runs that already exist when the root watch starts
    pub scan_existing: bool,
    /// File types a run must deliver: required types plus ancillary flag types
    pub wanted_types: BTreeSet<String>,
}

/// How a nested run watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub dir: PathBuf,
    pub found: BTreeSet<String>,
    pub complete: bool,
}

pub struct RunsWatcher {
    options: Arc<RunsOptions>,
    detector: StabilityDetector,
    extractor: Arc<IdentityExtractor>,
    events: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
    roots: HashMap<PathBuf, JoinHandle<()>>,
}

impl RunsWatcher {
    pub fn new(
        options: RunsOptions,
        detector: StabilityDetector,
        extractor: Arc<IdentityExtractor>,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            detector,
            extractor,
            events,
            shutdown: CancellationToken::new(),
            roots: HashMap::new(),
        }
    }
}

#[async_trait]
impl WatchSource for RunsWatcher {
    fn name(&self) -> &str {
        "runs"
    }

    fn add_watch(&mut self, path: &Path) -> Result<(), WatchError> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::Closed {
                source_name: self.name().to_string(),
            });
        }
        if self.roots.contains_key(path) {
            crate::debug_event!("runs", "already watching", "{}", path.display());
            return Ok(());
        }

        let task = tokio::spawn(watch_root(
            path.to_path_buf(),
            self.options.clone(),
            self.detector,
            self.extractor.clone(),
            self.events.clone(),
            self.shutdown.child_token(),
        ));
        self.roots.insert(path.to_path_buf(), task);

        crate::log_event!(
            "runs",
            "watching",
            "{}/*/{}",
            path.display(),
            self.options.subdirectory
        );
        Ok(())
    }

    fn watched(&self) -> Vec<PathBuf> {
        self.roots.keys().cloned().collect()
    }

    async fn close(&mut self) {
        self.shutdown.cancel();
        for (path, task) in self.roots.drain() {
            if let Err(e) = task.await {
                tracing::error!("[runs] root task for {} failed: {e}", path.display());
            }
        }
        crate::log_event!("runs", "closed");
    }
}

fn is_run_dir(dir: &Path, prefix: Option<&str>) -> bool {
    match prefix {
        None => true,
        Some(prefix) => dir
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(prefix)),
    }
}

async fn watch_root(
    root: PathBuf,
    options: Arc<RunsOptions>,
    detector: StabilityDetector,
    extractor: Arc<IdentityExtractor>,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let since = if options.scan_existing {
        SystemTime::UNIX_EPOCH
    } else {
        SystemTime::now()
    };
    let mut scan = DirectoryScan::new(EntryKind::Dirs, since);
    let mut started: HashSet<PathBuf> = HashSet::new();
    let mut runs: JoinSet<RunSummary> = JoinSet::new();
    let wanted: Arc<BTreeSet<String>> = Arc::new(options.wanted_types.clone());

    let mut ticker = interval(options.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = runs.join_next() => {
                log_run_end(joined);
                continue;
            }
            _ = ticker.tick() => {}
        }

        let run_dirs = match scan.changed(&root).await {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!("[runs] failed to list {}: {e}", root.display());
                continue;
            }
        };

        for run_dir in run_dirs {
            if !is_run_dir(&run_dir, options.run_prefix.as_deref()) {
                continue;
            }
            if !started.insert(run_dir.clone()) {
                continue;
            }

            let target = run_dir.join(&options.subdirectory);
            crate::log_event!("runs", "new run", "{}", target.display());
            runs.spawn(watch_run(
                target,
                options.period,
                detector,
                extractor.clone(),
                wanted.clone(),
                events.clone(),
                cancel.child_token(),
            ));
        }
    }

    // Children observe the same cancellation; wait for all of them.
    while let Some(joined) = runs.join_next().await {
        log_run_end(joined);
    }
    crate::debug_event!("runs", "stopped", "{}", root.display());
}

fn log_run_end(joined: Result<RunSummary, tokio::task::JoinError>) {
    match joined {
        Ok(summary) if summary.complete => {
            crate::log_event!(
                "runs",
                "run complete",
                "{} ({} types)",
                summary.dir.display(),
                summary.found.len()
            );
        }
        Ok(summary) => {
            crate::log_event!(
                "runs",
                "run cancelled",
                "{} ({} types seen)",
                summary.dir.display(),
                summary.found.len()
            );
        }
        Err(e) => tracing::error!("[runs] run watch failed: {e}"),
    }
}

/// Poll one run's result directory until every wanted type has been seen or
/// the watch is cancelled.
pub async fn watch_run(
    dir: PathBuf,
    period: Duration,
    detector: StabilityDetector,
    extractor: Arc<IdentityExtractor>,
    wanted: Arc<BTreeSet<String>>,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> RunSummary {
    let mut scan = DirectoryScan::new(EntryKind::Files, SystemTime::UNIX_EPOCH);
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while found.len() < wanted.len() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stable = tokio::select! {
            _ = cancel.cancelled() => break,
            result = scan.stable_files(&dir, detector) => result,
        };

        let paths = match stable {
            Ok(paths) => paths,
            Err(e) => {
                // The result directory usually appears some time after the run
                crate::debug_event!("runs", "not readable yet", "{}: {e}", dir.display());
                continue;
            }
        };

        for path in paths {
            let type_name = match extractor.classify_path(&path) {
                Ok(c) if wanted.contains(&c.type_name) => c.type_name,
                _ => continue,
            };
            if !found.insert(type_name.clone()) {
                continue;
            }

            crate::log_event!("runs", "arrived", "{type_name} {}", path.display());
            if events.send(WatchEvent::new(path)).await.is_err() {
                tracing::warn!("[runs] event queue closed, stopping {}", dir.display());
                return RunSummary {
                    dir,
                    found,
                    complete: false,
                };
            }
        }
    }

    let complete = found.len() >= wanted.len();
    RunSummary {
        dir,
        found,
        complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileTypeSpec;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn extractor() -> Arc<IdentityExtractor> {
        Arc::new(IdentityExtractor::new(vec![
            FileTypeSpec::new("SVM10", r"^SVM10_(?P<id>[^_]+)_", true).unwrap(),
            FileTypeSpec::new("GMTCO", r"^GMTCO_(?P<id>[^_]+)_", true).unwrap(),
            FileTypeSpec::new("SVI01", r"^SVI01_(?P<id>[^_]+)_", false).unwrap(),
        ]))
    }

    fn wanted() -> BTreeSet<String> {
        ["SVM10", "GMTCO"].iter().map(|s| s.to_string()).collect()
    }

    fn detector() -> StabilityDetector {
        StabilityDetector::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_run_watch_stops_after_required_types() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SVM10_g1_a.h5"), b"m10").unwrap();
        fs::write(dir.path().join("GMTCO_g1_a.h5"), b"geo").unwrap();
        fs::write(dir.path().join("SVI01_g1_a.h5"), b"i01").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let summary = timeout(
            Duration::from_secs(5),
            watch_run(
                dir.path().to_path_buf(),
                Duration::from_millis(30),
                detector(),
                extractor(),
                Arc::new(wanted()),
                tx,
                CancellationToken::new(),
            ),
        )
        .await
        .expect("run watch did not terminate");

        assert!(summary.complete);
        assert_eq!(summary.found.len(), 2);

        let mut emitted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            emitted.push(event.path.file_name().unwrap().to_string_lossy().to_string());
        }
        emitted.sort();
        assert_eq!(emitted, vec!["GMTCO_g1_a.h5", "SVM10_g1_a.h5"]);
    }

    #[tokio::test]
    async fn test_run_watch_waits_for_late_directory_and_cancels() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("result");
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(watch_run(
            result_dir.clone(),
            Duration::from_millis(30),
            detector(),
            extractor(),
            Arc::new(wanted()),
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        fs::create_dir(&result_dir).unwrap();
        fs::write(result_dir.join("SVM10_g1_a.h5"), b"m10").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        let summary = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!summary.complete);
        assert!(summary.found.contains("SVM10"));
    }

    #[tokio::test]
    async fn test_root_spawns_nested_watch_for_new_prefixed_runs() {
        let root = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = RunsWatcher::new(
            RunsOptions {
                period: Duration::from_millis(40),
                subdirectory: "result".to_string(),
                run_prefix: Some("NPP".to_string()),
                scan_existing: false,
                wanted_types: wanted(),
            },
            detector(),
            extractor(),
            tx,
        );
        watcher.add_watch(root.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ignored = root.path().join("TMP_run").join("result");
        fs::create_dir_all(&ignored).unwrap();
        fs::write(ignored.join("SVM10_zz_a.h5"), b"m10").unwrap();

        let run = root.path().join("NPP_run1").join("result");
        fs::create_dir_all(&run).unwrap();
        fs::write(run.join("SVM10_g1_a.h5"), b"m10").unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        assert_eq!(event.path, run.join("SVM10_g1_a.h5"));

        timeout(Duration::from_secs(5), watcher.close())
            .await
            .expect("close did not finish");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_run_prefix_filter() {
        assert!(is_run_dir(Path::new("/data/NPP_1"), Some("NPP")));
        assert!(!is_run_dir(Path::new("/data/J01_1"), Some("NPP")));
        assert!(is_run_dir(Path::new("/data/J01_1"), None));
    }
}
