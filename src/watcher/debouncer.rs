//! Coalescing of push notifications per path.
//!
//! A file being written produces a burst of modify events. The debouncer keeps
//! the time of the latest event per path and releases a path once it has been
//! quiet for the configured duration, so only one stability check runs per
//! burst.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Debouncer {
    /// path -> time of the latest event
    pending: HashMap<PathBuf, Instant>,
    quiet: Duration,
}

impl Debouncer {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            quiet: Duration::from_millis(debounce_ms),
        }
    }

    /// Record an event for `path`, restarting its quiet period.
    pub fn record(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Drop a path, e.g. after it was removed.
    pub fn forget(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    /// Take every path that has been quiet for the full duration.
    pub fn take_ready(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let mut ready = Vec::new();

        self.pending.retain(|path, last_event| {
            if now.duration_since(*last_event) >= self.quiet {
                ready.push(path.clone());
                false
            } else {
                true
            }
        });

        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_burst_releases_single_path() {
        let mut debouncer = Debouncer::new(40);
        let path = PathBuf::from("/incoming/SVM10_a.h5");

        for _ in 0..5 {
            debouncer.record(path.clone());
        }
        assert!(debouncer.take_ready().is_empty());

        sleep(Duration::from_millis(50));
        assert_eq!(debouncer.take_ready(), vec![path]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_new_event_restarts_quiet_period() {
        let mut debouncer = Debouncer::new(50);
        let path = PathBuf::from("/incoming/SVM07_a.h5");

        debouncer.record(path.clone());
        sleep(Duration::from_millis(30));
        debouncer.record(path.clone());
        sleep(Duration::from_millis(30));
        assert!(debouncer.take_ready().is_empty());

        sleep(Duration::from_millis(30));
        assert_eq!(debouncer.take_ready().len(), 1);
    }

    #[test]
    fn test_forget_drops_pending_path() {
        let mut debouncer = Debouncer::new(10);
        let path = PathBuf::from("/incoming/GMTCO_a.h5");
        debouncer.record(path.clone());
        debouncer.forget(&path);

        sleep(Duration::from_millis(20));
        assert!(debouncer.take_ready().is_empty());
    }
}
