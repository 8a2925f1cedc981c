//! Per-granule accumulation of arriving file types.
//!
//! # Architecture
//!
//! ```text
//! classified arrival (type, id, path)
//!         |
//!   GranuleAccumulator  (single owner of the pending table)
//!         |  merge into GranuleRecord
//!         |  CompletionRule::is_complete
//!         v
//!   Complete(record)  -> removed from the table, handed to dispatch
//! ```

mod accumulator;
mod completion;
mod error;
mod record;

pub use accumulator::{Arrival, GranuleAccumulator};
pub use completion::CompletionRule;
pub use error::AccumulateError;
pub use record::GranuleRecord;
