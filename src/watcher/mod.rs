//! Watch sources producing stable-file events.
//!
//! Three interchangeable sources implement [`WatchSource`] and feed the same
//! event queue:
//!
//! ```text
//!   PushWatcher   notify events -> Debouncer -> StabilityDetector
//!   PollWatcher   DirectoryScan (high-water mark) -> StabilityDetector
//!   RunsWatcher   root DirectoryScan -> one nested poll per run
//!         |
//!         v
//!   mpsc::Sender<WatchEvent>
//! ```

mod debouncer;
mod error;
mod poll;
mod push;
mod runs;
mod scan;
mod source;
mod stability;

pub use debouncer::Debouncer;
pub use error::WatchError;
pub use poll::PollWatcher;
pub use push::PushWatcher;
pub use runs::{RunSummary, RunsOptions, RunsWatcher, watch_run};
pub use scan::{DirectoryScan, EntryKind};
pub use source::{WatchEvent, WatchSource, build_source};
pub use stability::StabilityDetector;
