//! Granule assembly and dispatch for satellite instrument files.
//!
//! Files of one observation ("granule") arrive independently. This crate
//! watches for them, waits until each is fully written, groups them by
//! granule id and, once the configured set is complete, runs a gated
//! two-stage external pipeline exactly once per granule.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod granule;
pub mod identity;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use dispatch::{DispatchOutcome, Dispatcher, GranuleProcessor};
pub use engine::{AssemblyStats, Engine, EngineError};
pub use granule::{Arrival, GranuleAccumulator, GranuleRecord};
pub use identity::{Classification, IdentityExtractor};
