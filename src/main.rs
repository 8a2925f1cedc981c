use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use granule_watch::cli::commands;
use granule_watch::cli::{Cli, Commands};
use granule_watch::{IdentityExtractor, Settings, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("Configuration error")?;
    logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Run => {
            commands::run::run(Arc::new(settings)).await?;
        }
        Commands::Config => {
            commands::config::run(&settings)?;
        }
        Commands::Classify { names, json } => {
            let extractor = IdentityExtractor::new(settings.file_type_specs()?);
            let failures = commands::classify::run(&extractor, &names, json);
            if failures > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
