//! Gate check and external pipeline for completed granules.

mod command;
mod dispatcher;
mod error;
mod gate;

pub use command::{CommandOutput, CommandRunner, ProcessRunner};
pub use dispatcher::{DispatchOutcome, Dispatcher, GranuleProcessor};
pub use error::{DispatchError, Stage};
pub use gate::{GateVerdict, MetadataGate};
