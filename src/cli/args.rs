//! Command-line argument definitions

use clap::{Args, ValueEnum};

/// How export progress is reported
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Progress bar on stderr
    #[default]
    Console,
    /// JSON lines on stdout
    Json,
    /// No progress output
    None,
}

/// Arguments for the export command
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Input media file (an asset description in JSON with --simulate)
    #[arg(short, long)]
    pub input: String,

    /// Output file path
    #[arg(short, long)]
    pub output: Option<String>,

    /// Resolution preset (240p, 360p, 480p, 540p, 720p, 1080p, 2k, 4k)
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Output container (mp4, mov, m4v); inferred from the output extension when omitted
    #[arg(long)]
    pub container: Option<String>,

    /// Start time (HH:MM:SS.ms, MM:SS.ms, or seconds)
    #[arg(short, long)]
    pub start: Option<String>,

    /// Duration to export (HH:MM:SS.ms, MM:SS.ms, or seconds)
    #[arg(short, long)]
    pub duration: Option<String>,

    /// Place the index at the front of the file for progressive playback
    #[arg(long)]
    pub network_optimized: bool,

    /// Container metadata entry, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,

    /// Progress reporting
    #[arg(long, value_enum, default_value_t = ProgressMode::Console)]
    pub progress: ProgressMode,

    /// Run against the in-memory backend instead of decoding real media
    #[arg(long)]
    pub simulate: bool,
}

/// Arguments for the probe command
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Input media file
    #[arg(short, long)]
    pub input: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Read the asset description from a JSON file instead of probing media
    #[arg(long)]
    pub simulate: bool,
}

/// Arguments for the presets command
#[derive(Args, Debug)]
pub struct PresetsArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the estimate command
#[derive(Args, Debug)]
pub struct EstimateArgs {
    /// Input media file
    #[arg(short, long)]
    pub input: String,

    /// Resolution preset
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Start time
    #[arg(short, long)]
    pub start: Option<String>,

    /// Duration to export
    #[arg(short, long)]
    pub duration: Option<String>,

    /// Read the asset description from a JSON file instead of probing media
    #[arg(long)]
    pub simulate: bool,
}
