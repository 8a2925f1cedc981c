//! One pass of a polling watch.
//!
//! A [`DirectoryScan`] lists a directory and reports entries whose
//! modification time is newer than its high-water mark. The mark then moves
//! to the time sampled at the *start* of the pass, so files landing while the
//! listing runs are seen on the next pass. Files that were found but not yet
//! stable are kept in a retry set and offered again on the next pass.
//!
//! Files already reported as stable are remembered by (mtime, size) and not
//! reported again until one of the two changes. This covers files dated after
//! the mark, such as future timestamps from a skewed remote clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::task::JoinSet;

use super::stability::StabilityDetector;

/// Which directory entries a scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Files,
    Dirs,
}

#[derive(Debug)]
pub struct DirectoryScan {
    kind: EntryKind,
    high_water: SystemTime,
    retry: BTreeSet<PathBuf>,
    emitted: HashMap<PathBuf, Fingerprint>,
}

/// Modification time and length of a file when it was reported.
type Fingerprint = (Option<SystemTime>, u64);

fn fingerprint(meta: &Metadata) -> Fingerprint {
    (meta.modified().ok(), meta.len())
}

impl DirectoryScan {
    pub fn new(kind: EntryKind, since: SystemTime) -> Self {
        Self {
            kind,
            high_water: since,
            retry: BTreeSet::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn high_water(&self) -> SystemTime {
        self.high_water
    }

    /// Entries changed since the previous pass, plus deferred retries.
    ///
    /// On a listing failure the mark is not advanced, so nothing is lost.
    pub async fn changed(&mut self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let pass_start = SystemTime::now();
        let mut found: BTreeSet<PathBuf> = std::mem::take(&mut self.retry);
        let mut listed: HashSet<PathBuf> = HashSet::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                self.retry = found;
                return Err(e);
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    self.retry = found;
                    return Err(e);
                }
            };
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    // Entry vanished between listing and stat
                    crate::debug_event!("poll", "skipped", "{}: {e}", entry.path().display());
                    continue;
                }
            };

            let wanted = match self.kind {
                EntryKind::Files => meta.is_file(),
                EntryKind::Dirs => meta.is_dir(),
            };
            if !wanted {
                continue;
            }

            let path = entry.path();
            listed.insert(path.clone());
            if self.emitted.get(&path) == Some(&fingerprint(&meta)) {
                found.remove(&path);
                continue;
            }

            let newer = meta
                .modified()
                .map(|mtime| mtime > self.high_water)
                .unwrap_or(true);
            if newer {
                found.insert(path);
            }
        }

        self.emitted.retain(|path, _| listed.contains(path));
        self.high_water = pass_start;
        Ok(found.into_iter().collect())
    }

    /// Number of reported files still remembered.
    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    /// Offer `path` again on the next pass.
    pub fn defer(&mut self, path: PathBuf) {
        self.retry.insert(path);
    }

    /// Run one pass and return the changed files that proved stable.
    ///
    /// Stability checks run concurrently and are all joined before returning.
    pub async fn stable_files(
        &mut self,
        dir: &Path,
        detector: StabilityDetector,
    ) -> io::Result<Vec<PathBuf>> {
        let candidates = self.changed(dir).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut checks = JoinSet::new();
        for path in candidates {
            checks.spawn(async move {
                if !detector.is_stable(&path).await {
                    return (path, None);
                }
                let print = tokio::fs::metadata(&path).await.ok().map(|m| fingerprint(&m));
                (path, print)
            });
        }

        let mut stable = Vec::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((path, Some(print))) => {
                    self.emitted.insert(path.clone(), print);
                    stable.push(path);
                }
                Ok((path, None)) => {
                    if path.exists() {
                        self.defer(path);
                    }
                }
                Err(e) => tracing::error!("[poll] stability check task failed: {e}"),
            }
        }
        stable.sort();
        Ok(stable)
    }
}
