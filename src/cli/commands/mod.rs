//! Command implementations for the CLI.

pub mod classify;
pub mod config;
pub mod run;
