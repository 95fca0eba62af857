// Domain models - Core types and data structures

use std::fmt;
use std::ops::{Add, Sub};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::composition::{AudioMix, VideoComposition};
use crate::domain::rules::Preset;
use crate::domain::settings::{AudioSettings, VideoOutputSettings, VideoSettings};
use crate::error::{ExportError, ExportResult};

/// Time specification with precision - represents time in seconds with fractional precision
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct TimeSpec {
    pub seconds: f64,
}

impl TimeSpec {
    /// Create a new TimeSpec from seconds
    pub fn from_seconds(seconds: f64) -> Self {
        Self { seconds }
    }

    pub const fn zero() -> Self {
        Self { seconds: 0.0 }
    }

    /// Create a new TimeSpec from hours, minutes, seconds, milliseconds
    pub fn from_components(hours: u32, minutes: u32, seconds: u32, milliseconds: u32) -> Self {
        let total_seconds = hours as f64 * 3600.0
            + minutes as f64 * 60.0
            + seconds as f64
            + milliseconds as f64 / 1000.0;
        Self {
            seconds: total_seconds,
        }
    }

    /// Timestamp expressed as `value / timescale`, the way container timebases count
    pub fn from_ticks(value: i64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::zero();
        }
        Self {
            seconds: value as f64 / timescale as f64,
        }
    }

    pub fn as_seconds(&self) -> f64 {
        self.seconds
    }

    /// Convert to Duration; negative values clamp to zero
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs_f64(self.seconds.max(0.0))
    }

    /// Convert from Duration
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            seconds: duration.as_secs_f64(),
        }
    }

    /// Parse time string in various formats
    pub fn parse(time_str: &str) -> ExportResult<Self> {
        let trimmed = time_str.trim();

        // Try parsing as seconds (float)
        if let Ok(seconds) = trimmed.parse::<f64>() {
            if seconds < 0.0 || !seconds.is_finite() {
                return Err(ExportError::configuration("Time cannot be negative"));
            }
            return Ok(Self::from_seconds(seconds));
        }

        let parts: Vec<&str> = trimmed.split(':').collect();
        let invalid = |what: &str| ExportError::configuration(format!("Invalid {} in '{}'", what, trimmed));
        match parts.as_slice() {
            [minutes, seconds] => {
                let minutes = minutes.parse::<u32>().map_err(|_| invalid("minutes"))?;
                let seconds = seconds.parse::<f64>().map_err(|_| invalid("seconds"))?;
                if !(0.0..60.0).contains(&seconds) {
                    return Err(ExportError::configuration("Seconds must be less than 60"));
                }
                Ok(Self::from_seconds(minutes as f64 * 60.0 + seconds))
            }
            [hours, minutes, seconds] => {
                let hours = hours.parse::<u32>().map_err(|_| invalid("hours"))?;
                let minutes = minutes.parse::<u32>().map_err(|_| invalid("minutes"))?;
                let seconds = seconds.parse::<f64>().map_err(|_| invalid("seconds"))?;
                if minutes >= 60 {
                    return Err(ExportError::configuration("Minutes must be less than 60"));
                }
                if !(0.0..60.0).contains(&seconds) {
                    return Err(ExportError::configuration("Seconds must be less than 60"));
                }
                Ok(Self::from_seconds(
                    hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds,
                ))
            }
            _ => Err(ExportError::configuration(
                "Invalid time format. Supported formats: seconds (e.g., 123.45), MM:SS.ms (e.g., 2:30.5), HH:MM:SS.ms (e.g., 1:02:30.5)",
            )),
        }
    }

    /// Format as HH:MM:SS.ms
    pub fn format_hms(&self) -> String {
        let total_ms = (self.seconds.max(0.0) * 1000.0).round() as u64;
        let hours = total_ms / 3_600_000;
        let minutes = (total_ms % 3_600_000) / 60_000;
        let seconds = (total_ms % 60_000) / 1000;
        let milliseconds = total_ms % 1000;

        if hours > 0 {
            format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, milliseconds)
        } else {
            format!("{:02}:{:02}.{:03}", minutes, seconds, milliseconds)
        }
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_hms())
    }
}

impl Add for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::from_seconds(self.seconds + rhs.seconds)
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;

    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::from_seconds(self.seconds - rhs.seconds)
    }
}

/// Portion of the source timeline to export.
///
/// A `duration` of `None` is unbounded: the range runs to the end of the asset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimeSpec,
    pub duration: Option<TimeSpec>,
}

impl TimeRange {
    /// The whole asset
    pub fn full() -> Self {
        Self {
            start: TimeSpec::zero(),
            duration: None,
        }
    }

    pub fn new(start: TimeSpec, duration: Option<TimeSpec>) -> ExportResult<Self> {
        if !start.seconds.is_finite() || start.seconds < 0.0 {
            return Err(ExportError::configuration(format!(
                "Time range start must be non-negative, got {}s",
                start.seconds
            )));
        }
        if let Some(duration) = duration {
            if !duration.seconds.is_finite() || duration.seconds < 0.0 {
                return Err(ExportError::configuration(format!(
                    "Time range duration must be non-negative, got {}s",
                    duration.seconds
                )));
            }
        }
        Ok(Self { start, duration })
    }

    pub fn is_unbounded(&self) -> bool {
        self.duration.is_none()
    }

    /// Duration this range covers on an asset of the given length
    pub fn resolved_duration(&self, asset_duration: TimeSpec) -> TimeSpec {
        match self.duration {
            Some(duration) => duration,
            None => asset_duration,
        }
    }

    /// Validate the range against the asset it will be applied to
    pub fn validate_against(&self, asset_duration: TimeSpec) -> ExportResult<()> {
        if self.start.seconds < 0.0 {
            return Err(ExportError::configuration("Time range start is negative"));
        }
        if let Some(duration) = self.duration {
            if duration.seconds > asset_duration.seconds {
                return Err(ExportError::configuration(format!(
                    "Time range duration ({:.3}s) exceeds asset duration ({:.3}s)",
                    duration.seconds, asset_duration.seconds
                )));
            }
        }
        Ok(())
    }

    /// Whether a source timestamp falls inside the range
    pub fn contains(&self, time: TimeSpec) -> bool {
        if time.seconds < self.start.seconds {
            return false;
        }
        match self.duration {
            Some(duration) => time.seconds < self.start.seconds + duration.seconds,
            None => true,
        }
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same frame with width and height exchanged
    pub fn swapped(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    /// Orientation-independent form: smaller dimension first
    pub fn portrait(&self) -> Self {
        if self.width > self.height {
            self.swapped()
        } else {
            *self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `other` fits inside this box without rotation
    pub fn contains(&self, other: &Size) -> bool {
        other.width <= self.width && other.height <= self.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Kind of an independent stream inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Output container kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Mp4,
    Mov,
    M4v,
    M4a,
}

impl ContainerKind {
    /// Conventional file extension
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Mp4 => "mp4",
            ContainerKind::Mov => "mov",
            ContainerKind::M4v => "m4v",
            ContainerKind::M4a => "m4a",
        }
    }

    /// Muxer short name understood by libavformat
    pub fn muxer_name(&self) -> &'static str {
        match self {
            ContainerKind::Mp4 | ContainerKind::M4v => "mp4",
            ContainerKind::Mov => "mov",
            ContainerKind::M4a => "ipod",
        }
    }

    /// Guess from a path's extension
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for ContainerKind {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp4" => Ok(ContainerKind::Mp4),
            "mov" | "quicktime" => Ok(ContainerKind::Mov),
            "m4v" => Ok(ContainerKind::M4v),
            "m4a" => Ok(ContainerKind::M4a),
            other => Err(ExportError::configuration(format!(
                "Unknown container '{}'. Valid containers: mp4, mov, m4v, m4a",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// 2D affine transform `[a b 0; c d 0; tx ty 1]`, row-vector convention
///
/// A point maps as `x' = a*x + c*y + tx`, `y' = b*x + d*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub const fn new(a: f64, b: f64, c: f64, d: f64, tx: f64, ty: f64) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    pub const fn translation(tx: f64, ty: f64) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    /// This transform followed by `other`
    pub fn then(&self, other: &AffineTransform) -> AffineTransform {
        AffineTransform {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            tx: self.tx * other.a + self.ty * other.c + other.tx,
            ty: self.tx * other.b + self.ty * other.d + other.ty,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    /// Inverse transform, `None` when singular
    pub fn inverse(&self) -> Option<AffineTransform> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        let tx = -(self.tx * a + self.ty * c);
        let ty = -(self.tx * b + self.ty * d);
        Some(AffineTransform { a, b, c, d, tx, ty })
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }
}

/// Video track description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrackInfo {
    pub track_id: u32,
    pub codec: String,
    pub natural_size: Size,
    /// Display transform stored with the track
    pub preferred_transform: AffineTransform,
    /// Nominal frame rate; zero when unknown
    pub nominal_frame_rate: f64,
    pub bit_rate: Option<u64>,
}

impl VideoTrackInfo {
    pub fn new(track_id: u32, natural_size: Size, nominal_frame_rate: f64) -> Self {
        Self {
            track_id,
            codec: "h264".to_string(),
            natural_size,
            preferred_transform: AffineTransform::identity(),
            nominal_frame_rate,
            bit_rate: None,
        }
    }

    pub fn with_transform(mut self, transform: AffineTransform) -> Self {
        self.preferred_transform = transform;
        self
    }
}

/// Audio track description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    pub track_id: u32,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: Option<u64>,
}

impl AudioTrackInfo {
    pub fn new(track_id: u32, sample_rate: u32, channels: u16) -> Self {
        Self {
            track_id,
            codec: "aac".to_string(),
            sample_rate,
            channels,
            bit_rate: None,
        }
    }
}

/// Source asset handle: where it lives and what it contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub source: String,
    pub duration: TimeSpec,
    pub video_tracks: Vec<VideoTrackInfo>,
    pub audio_tracks: Vec<AudioTrackInfo>,
}

impl AssetInfo {
    pub fn new(source: impl Into<String>, duration: TimeSpec) -> Self {
        Self {
            source: source.into(),
            duration,
            video_tracks: Vec::new(),
            audio_tracks: Vec::new(),
        }
    }

    pub fn with_video_track(mut self, track: VideoTrackInfo) -> Self {
        self.video_tracks.push(track);
        self
    }

    pub fn with_audio_track(mut self, track: AudioTrackInfo) -> Self {
        self.audio_tracks.push(track);
        self
    }

    /// Get primary video track (the first one)
    pub fn primary_video_track(&self) -> Option<&VideoTrackInfo> {
        self.video_tracks.first()
    }

    /// Get primary audio track
    pub fn primary_audio_track(&self) -> Option<&AudioTrackInfo> {
        self.audio_tracks.first()
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => !self.audio_tracks.is_empty(),
            TrackKind::Video => !self.video_tracks.is_empty(),
        }
    }
}

/// Output metadata entry written into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FromStr for MetadataItem {
    type Err = ExportError;

    /// Parse `key=value`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            }
            _ => Err(ExportError::configuration(format!(
                "Invalid metadata entry '{}', expected KEY=VALUE",
                s
            ))),
        }
    }
}

/// Export session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    #[default]
    Idle,
    ReadingAndWriting,
    Completed,
    Failed,
    Cancelled,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Cancelled
        )
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportStatus::Idle => "idle",
            ExportStatus::ReadingAndWriting => "reading_and_writing",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
            ExportStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Status reported by the external reader and writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    #[default]
    Unknown,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One export job: what to read, where to write it, and how to encode it
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub asset: AssetInfo,
    pub output_path: Option<PathBuf>,
    pub container: ContainerKind,
    pub time_range: TimeRange,
    pub video_composition: Option<VideoComposition>,
    pub audio_mix: Option<AudioMix>,
    /// Decode format requested from the reader for video
    pub video_output_settings: Option<VideoOutputSettings>,
    /// Encoder settings for video; derived from the preset when absent
    pub video_settings: Option<VideoSettings>,
    /// Encoder settings for audio; AAC stereo defaults when absent
    pub audio_settings: Option<AudioSettings>,
    pub preset: Preset,
    pub network_optimized: bool,
    pub metadata: Vec<MetadataItem>,
}

impl ExportJob {
    /// Create a job exporting the whole asset with the given preset
    pub fn new(asset: AssetInfo, preset: Preset) -> Self {
        Self {
            asset,
            output_path: None,
            container: ContainerKind::default(),
            time_range: TimeRange::full(),
            video_composition: None,
            audio_mix: None,
            video_output_settings: None,
            video_settings: None,
            audio_settings: None,
            preset,
            network_optimized: false,
            metadata: Vec::new(),
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_container(mut self, container: ContainerKind) -> Self {
        self.container = container;
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn with_video_composition(mut self, composition: VideoComposition) -> Self {
        self.video_composition = Some(composition);
        self
    }

    pub fn with_audio_mix(mut self, mix: AudioMix) -> Self {
        self.audio_mix = Some(mix);
        self
    }

    pub fn with_video_output_settings(mut self, settings: VideoOutputSettings) -> Self {
        self.video_output_settings = Some(settings);
        self
    }

    pub fn with_video_settings(mut self, settings: VideoSettings) -> Self {
        self.video_settings = Some(settings);
        self
    }

    pub fn with_audio_settings(mut self, settings: AudioSettings) -> Self {
        self.audio_settings = Some(settings);
        self
    }

    pub fn with_network_optimized(mut self, enabled: bool) -> Self {
        self.network_optimized = enabled;
        self
    }

    pub fn with_metadata(mut self, item: MetadataItem) -> Self {
        self.metadata.push(item);
        self
    }

    /// Check the job's invariants against its asset
    pub fn validate(&self) -> ExportResult<()> {
        TimeRange::new(self.time_range.start, self.time_range.duration)?;
        self.time_range.validate_against(self.asset.duration)?;
        if let Some(settings) = &self.audio_settings {
            settings.validate()?;
        }
        if let Some(settings) = &self.video_settings {
            settings.validate()?;
        }
        Ok(())
    }

    /// Seconds of media this job will produce
    pub fn total_duration(&self) -> TimeSpec {
        self.time_range.resolved_duration(self.asset.duration)
    }
}
