//! Write-completion detection by size quiescence.
//!
//! Instrument files are written incrementally. A file counts as finished once
//! two size samples taken a fixed interval apart agree. A failed stat is never
//! treated as stable: the caller sees `false` and retries on its next cycle.

use std::path::Path;
use std::time::Duration;

/// Samples a file's size twice, `quiescence` apart.
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    quiescence: Duration,
}

impl StabilityDetector {
    pub fn new(quiescence: Duration) -> Self {
        Self { quiescence }
    }

    /// Whether `path` is a regular file whose size did not change across the
    /// quiescence interval.
    pub async fn is_stable(&self, path: &Path) -> bool {
        let Some(before) = sample_size(path).await else {
            return false;
        };

        tokio::time::sleep(self.quiescence).await;

        let Some(after) = sample_size(path).await else {
            return false;
        };

        if before != after {
            crate::debug_event!(
                "stability",
                "still growing",
                "{} ({before} -> {after} bytes)",
                path.display()
            );
        }
        before == after
    }
}

async fn sample_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(_) => {
            crate::debug_event!("stability", "not a regular file", "{}", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("[stability] failed to stat {}: {e}", path.display());
            None
        }
    }
}
