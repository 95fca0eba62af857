//! Command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapters::memory::MemoryBackend;
use crate::cli::args::{EstimateArgs, ExportArgs, PresetsArgs, ProbeArgs, ProgressMode};
use crate::config_initialization::AppConfig;
use crate::domain::model::{
    AssetInfo, ContainerKind, ExportJob, ExportStatus, MetadataItem, Size, TimeRange, TimeSpec,
};
use crate::domain::orientation::{rotation_of, Rotation};
use crate::domain::rules::{Preset, PresetTable};
use crate::engine::progress::{ConsoleProgressCallback, JsonProgressCallback};
use crate::engine::ExportSession;
use crate::ports::MediaBackend;
use crate::utils::Utils;

/// Execute the export command
pub async fn export(args: ExportArgs, config: &AppConfig) -> Result<()> {
    info!("Starting export operation");
    info!("Input: {}", args.input);

    let asset = load_asset(&args.input, args.simulate)?;
    let preset = config.preset()?;
    let output = args.output.as_ref().map(PathBuf::from);

    // an explicit --container wins, then the output extension, then the config
    let container = match (&args.container, output.as_deref().and_then(ContainerKind::from_path)) {
        (None, Some(kind)) => kind,
        _ => config.container()?,
    };

    let mut job = ExportJob::new(asset, preset)
        .with_container(container)
        .with_time_range(parse_range(args.start.as_deref(), args.duration.as_deref())?)
        .with_network_optimized(config.export.network_optimized)
        .with_audio_settings(config.audio_settings());
    if let Some(output) = &output {
        job = job.with_output(output);
    }
    for entry in &args.meta {
        let item: MetadataItem = entry
            .parse()
            .with_context(|| format!("Invalid --meta value '{}'", entry))?;
        job = job.with_metadata(item);
    }

    let session = ExportSession::with_backend(backend(args.simulate)?);
    session.configure(job).context("Invalid export job")?;
    match args.progress {
        ProgressMode::Console => session.set_progress_callback(Arc::new(ConsoleProgressCallback::new(false))),
        ProgressMode::Json => session.set_progress_callback(Arc::new(JsonProgressCallback::new(true))),
        ProgressMode::None => {}
    }
    info!(
        "Preset: {}, container: {}, estimated size: {}",
        preset,
        container,
        Utils::format_file_size(session.estimated_output_size())
    );

    let canceller = session.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling export");
            canceller.cancel();
        }
    });
    let report = session.export().await;
    interrupt.abort();

    match report.status {
        ExportStatus::Completed => {
            if args.progress != ProgressMode::Json {
                if let Some(path) = &report.output_path {
                    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                    println!("Output: {}", path.display());
                    println!("Size: {}", Utils::format_file_size(size));
                }
                println!("Elapsed: {}", Utils::format_duration(report.elapsed));
            }
            info!("Export operation completed successfully");
            Ok(())
        }
        ExportStatus::Cancelled => Err(anyhow::anyhow!("Export cancelled")),
        _ => match report.error {
            Some(error) => Err(anyhow::Error::new(error).context("Export failed")),
            None => Err(anyhow::anyhow!("Export ended in state {}", report.status)),
        },
    }
}

#[derive(Serialize)]
struct ProbeReport<'a> {
    asset: &'a AssetInfo,
    rotation_degrees: Option<u32>,
    render_size: Option<Size>,
}

/// Execute the probe command
pub fn probe(args: ProbeArgs) -> Result<()> {
    info!("Starting probe operation");
    let asset = load_asset(&args.input, args.simulate)?;
    let orientation = asset
        .primary_video_track()
        .map(|track| {
            let rotation = rotation_of(&track.preferred_transform);
            (rotation, rotation.render_size(track.natural_size))
        });

    if args.json {
        let report = ProbeReport {
            asset: &asset,
            rotation_degrees: orientation.map(|(rotation, _)| rotation.degrees()),
            render_size: orientation.map(|(_, size)| size),
        };
        let json = serde_json::to_string_pretty(&report)
            .context("Failed to serialize asset info to JSON")?;
        println!("{}", json);
    } else {
        display_asset_info(&asset, orientation);
    }
    Ok(())
}

#[derive(Serialize)]
struct PresetRow {
    name: &'static str,
    width: u32,
    height: u32,
    bit_rate: u64,
}

/// Execute the presets command
pub fn presets(args: PresetsArgs) -> Result<()> {
    let rows: Vec<PresetRow> = Preset::ALL
        .iter()
        .map(|preset| {
            let size = PresetTable::resolution_for(*preset);
            PresetRow {
                name: preset.name(),
                width: size.width,
                height: size.height,
                bit_rate: PresetTable::bitrate_for(*preset),
            }
        })
        .collect();

    if args.json {
        let json = serde_json::to_string_pretty(&rows).context("Failed to serialize presets to JSON")?;
        println!("{}", json);
    } else {
        println!("Presets");
        println!("=======");
        for row in &rows {
            println!(
                "  {:<6} {:>5}x{:<5} {}",
                row.name,
                row.width,
                row.height,
                Utils::format_bit_rate(row.bit_rate)
            );
        }
    }
    Ok(())
}

/// Execute the estimate command
pub fn estimate(args: EstimateArgs, config: &AppConfig) -> Result<()> {
    let asset = load_asset(&args.input, args.simulate)?;
    let preset = config.preset()?;
    let job = ExportJob::new(asset, preset)
        .with_time_range(parse_range(args.start.as_deref(), args.duration.as_deref())?)
        .with_audio_settings(config.audio_settings());
    let duration = job.total_duration();

    let session = ExportSession::with_backend(Arc::new(MemoryBackend::new()));
    session.configure(job).context("Invalid export job")?;
    let bytes = session.estimated_output_size();
    debug!(bytes, "estimated output size");

    println!("Preset: {}", preset);
    println!("Duration: {}", Utils::format_duration(duration.to_duration()));
    if bytes == 0 {
        println!("Estimated size: unknown (asset has no video track)");
    } else {
        println!("Estimated size: {} ({} bytes)", Utils::format_file_size(bytes), bytes);
    }
    Ok(())
}

fn parse_range(start: Option<&str>, duration: Option<&str>) -> Result<TimeRange> {
    let start = match start {
        Some(value) => TimeSpec::parse(value).with_context(|| format!("Invalid start time '{}'", value))?,
        None => TimeSpec::zero(),
    };
    let duration = duration
        .map(|value| TimeSpec::parse(value).with_context(|| format!("Invalid duration '{}'", value)))
        .transpose()?;
    Ok(TimeRange::new(start, duration)?)
}

/// Asset description: probed from media, or read as JSON when simulating
fn load_asset(input: &str, simulate: bool) -> Result<AssetInfo> {
    let path = Path::new(input);
    if !path.exists() {
        return Err(anyhow::anyhow!("Input file does not exist: {}", input));
    }
    if simulate {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read asset description {}", input))?;
        return serde_json::from_str(&content)
            .with_context(|| format!("Invalid asset description in {}", input));
    }
    probe_media(path)
}

#[cfg(feature = "libav")]
fn probe_media(path: &Path) -> Result<AssetInfo> {
    crate::adapters::libav::probe_asset(path).context("Failed to inspect input file")
}

#[cfg(not(feature = "libav"))]
fn probe_media(_path: &Path) -> Result<AssetInfo> {
    Err(anyhow::anyhow!(
        "Built without the libav feature; only --simulate is available"
    ))
}

fn backend(simulate: bool) -> Result<Arc<dyn MediaBackend>> {
    if simulate {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    media_backend()
}

#[cfg(feature = "libav")]
fn media_backend() -> Result<Arc<dyn MediaBackend>> {
    let backend = crate::adapters::libav::LibavBackend::new().context("Failed to initialize FFmpeg")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "libav"))]
fn media_backend() -> Result<Arc<dyn MediaBackend>> {
    Err(anyhow::anyhow!(
        "Built without the libav feature; only --simulate is available"
    ))
}

/// Display asset information in human-readable format
fn display_asset_info(asset: &AssetInfo, orientation: Option<(Rotation, Size)>) {
    println!("Media Information");
    println!("=================");
    println!("Source: {}", asset.source);
    println!("Duration: {}", asset.duration.format_hms());
    println!();

    if !asset.video_tracks.is_empty() {
        println!("Video Tracks:");
        for track in &asset.video_tracks {
            println!(
                "  Track {}: {} @ {:.2} fps",
                track.track_id, track.natural_size, track.nominal_frame_rate
            );
            println!("    Codec: {}", track.codec);
            if let Some(bit_rate) = track.bit_rate {
                println!("    Bit Rate: {}", Utils::format_bit_rate(bit_rate));
            }
        }
        if let Some((rotation, render_size)) = orientation {
            println!("  Rotation: {}", rotation);
            println!("  Upright Size: {}", render_size);
        }
        println!();
    }

    if !asset.audio_tracks.is_empty() {
        println!("Audio Tracks:");
        for track in &asset.audio_tracks {
            println!(
                "  Track {}: {} Hz, {} channels",
                track.track_id, track.sample_rate, track.channels
            );
            println!("    Codec: {}", track.codec);
            if let Some(bit_rate) = track.bit_rate {
                println!("    Bit Rate: {}", Utils::format_bit_rate(bit_rate));
            }
        }
    }
}
