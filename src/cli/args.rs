//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Granule assembly and dispatch for VIIRS data
#[derive(Parser, Debug)]
#[command(
    name = "granule-watch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Assemble satellite granules from arriving files and run the processing pipeline",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to a TOML or JSON config file
    #[arg(short, long, global = true, env = "GW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the configured directory until Ctrl-C
    #[command(
        about = "Watch, assemble and dispatch granules",
        after_help = "Examples:\n  granule-watch run\n  granule-watch -c viirs.toml run\n  GW_WATCHER__MODE=poll granule-watch run"
    )]
    Run,

    /// Print the effective settings
    #[command(about = "Display effective settings as TOML")]
    Config,

    /// Dry-run the filename classifier
    #[command(
        about = "Show file type and granule id for filenames",
        after_help = "Example:\n  granule-watch classify SVM10_npp_d20240101_t0100000_e0101000_b01_c2024.h5"
    )]
    Classify {
        /// Filenames or paths to classify
        #[arg(value_name = "NAME", required = true)]
        names: Vec<String>,

        /// One JSON object per line instead of text
        #[arg(long)]
        json: bool,
    },
}
