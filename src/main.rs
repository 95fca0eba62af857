//! Reframe CLI
//!
//! # Usage
//!
//! ```bash
//! reframe export --input clip.mov --output clip.mp4 --preset 720p
//! reframe probe --input clip.mov
//! reframe presets
//! reframe estimate --input clip.mov --preset 1080p --duration 30
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use reframe_cli::adapters::TomlConfigAdapter;
use reframe_cli::cli::{commands, Cli, Commands};
use reframe_cli::config_initialization::initialize_configuration_hierarchy;
use reframe_cli::utils::logging::init_logging;

/// Main entry point for the Reframe CLI
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = initialize_configuration_hierarchy(
        &TomlConfigAdapter::new(),
        cli.config.as_deref(),
        &cli.config_overrides(),
    )
    .await
    .context("Failed to load configuration")?;
    init_logging(&config.logging_config()?)?;
    debug!(?config, "effective configuration");

    match cli.command {
        Commands::Export(args) => {
            info!("Executing export command");
            commands::export(args, &config).await?;
        }
        Commands::Probe(args) => {
            info!("Executing probe command");
            commands::probe(args)?;
        }
        Commands::Presets(args) => commands::presets(args)?,
        Commands::Estimate(args) => {
            info!("Executing estimate command");
            commands::estimate(args, &config)?;
        }
    }

    Ok(())
}
