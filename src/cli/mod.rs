//! CLI module for Reframe
//!
//! This module handles command-line argument parsing and command execution.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config_initialization::ConfigOverrides;

pub mod args;
pub mod commands;

pub use args::{EstimateArgs, ExportArgs, PresetsArgs, ProbeArgs, ProgressMode};

/// Reframe media exporter
///
/// Re-encodes a media file to H.264/AAC at a resolution preset, correcting
/// the rotation stored in the video track and reporting progress as it goes.
#[derive(Parser, Debug)]
#[command(name = "reframe")]
#[command(about = "Reframe - orientation-correcting media export with resolution presets")]
#[command(version)]
#[command(long_about = None)]
pub struct Cli {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "REFRAME_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Configuration file (default: ./reframe.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export a media file through a resolution preset
    Export(ExportArgs),
    /// Print the tracks and detected rotation of a media file
    Probe(ProbeArgs),
    /// List the resolution presets
    Presets(PresetsArgs),
    /// Estimate the output size of an export
    Estimate(EstimateArgs),
}

impl Cli {
    /// Command-line values that override the configuration file
    pub fn config_overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            ..ConfigOverrides::default()
        };
        match &self.command {
            Commands::Export(args) => {
                overrides.preset = args.preset.clone();
                overrides.container = args.container.clone();
                overrides.network_optimized = args.network_optimized;
            }
            Commands::Estimate(args) => {
                overrides.preset = args.preset.clone();
            }
            Commands::Probe(_) | Commands::Presets(_) => {}
        }
        overrides
    }
}
