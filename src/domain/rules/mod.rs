// Domain rules - Business logic and policies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::model::{Size, TimeSpec};
use crate::domain::settings::VideoSettings;
use crate::error::ExportError;

/// Output quality tier, listed in ascending resolution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Preset {
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "540p")]
    P540,
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2k")]
    P2K,
    #[serde(rename = "4k")]
    P4K,
}

impl Preset {
    pub const ALL: [Preset; 8] = [
        Preset::P240,
        Preset::P360,
        Preset::P480,
        Preset::P540,
        Preset::P720,
        Preset::P1080,
        Preset::P2K,
        Preset::P4K,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::P240 => "240p",
            Preset::P360 => "360p",
            Preset::P480 => "480p",
            Preset::P540 => "540p",
            Preset::P720 => "720p",
            Preset::P1080 => "1080p",
            Preset::P2K => "2k",
            Preset::P4K => "4k",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Preset {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let normalized = normalized.strip_prefix('p').unwrap_or(normalized.as_str());
        let normalized = normalized.strip_suffix('p').unwrap_or(normalized);
        match normalized {
            "240" => Ok(Preset::P240),
            "360" => Ok(Preset::P360),
            "480" => Ok(Preset::P480),
            "540" => Ok(Preset::P540),
            "720" => Ok(Preset::P720),
            "1080" => Ok(Preset::P1080),
            "2k" | "1440" => Ok(Preset::P2K),
            "4k" | "2160" => Ok(Preset::P4K),
            _ => Err(ExportError::configuration(format!(
                "Unknown preset '{}'. Valid presets: 240p, 360p, 480p, 540p, 720p, 1080p, 2k, 4k",
                s
            ))),
        }
    }
}

/// Preset → resolution ceiling and bitrate lookups
pub struct PresetTable;

impl PresetTable {
    /// Resolution box of a preset, portrait form (width ≤ height)
    pub fn resolution_for(preset: Preset) -> Size {
        match preset {
            Preset::P240 => Size::new(240, 360),
            Preset::P360 => Size::new(360, 480),
            Preset::P480 => Size::new(480, 640),
            Preset::P540 => Size::new(540, 960),
            Preset::P720 => Size::new(720, 1280),
            Preset::P1080 => Size::new(1080, 1920),
            Preset::P2K => Size::new(1440, 2560),
            Preset::P4K => Size::new(2160, 3840),
        }
    }

    /// Average video bitrate of a preset in bits per second
    pub fn bitrate_for(preset: Preset) -> u64 {
        match preset {
            Preset::P240 => 450_000,
            Preset::P360 => 770_000,
            Preset::P480 => 1_200_000,
            Preset::P540 => 2_074_000,
            Preset::P720 => 3_500_000,
            Preset::P1080 => 7_900_000,
            Preset::P2K => 13_000_000,
            Preset::P4K => 35_000_000,
        }
    }

    /// Smallest preset whose box encloses `size` in either orientation.
    ///
    /// Sizes larger than every box fall back to the smallest preset.
    pub fn preset_for(size: Size) -> Preset {
        let size = size.portrait();
        Preset::ALL
            .into_iter()
            .find(|preset| Self::resolution_for(*preset).contains(&size))
            .unwrap_or(Preset::P240)
    }
}

/// Derivation of encoder settings from a render size and preset
pub struct VideoSettingsDeriver;

impl VideoSettingsDeriver {
    /// Encoder settings for a frame of `size` exported at `preset`.
    ///
    /// The frame is scaled down, keeping its aspect, until its long side fits the
    /// preset; it is never scaled up. The bitrate follows the preset the scaled
    /// frame actually lands in.
    pub fn derive_video_settings(size: Size, preset: Preset) -> VideoSettings {
        let scaled = Self::scaled_size(size, preset);
        let bit_rate = PresetTable::bitrate_for(PresetTable::preset_for(scaled));
        VideoSettings::new(scaled, bit_rate)
    }

    pub fn scaled_size(size: Size, preset: Preset) -> Size {
        let target = PresetTable::resolution_for(preset);
        let (w, h) = (size.width as f64, size.height as f64);
        let ratio = if w > h {
            w / target.height as f64
        } else {
            w / target.width as f64
        };
        if ratio > 1.0 {
            Size::new(round_even(w / ratio), round_even(h / ratio))
        } else {
            size
        }
    }
}

/// Nearest even integer, never below 2; encoders reject odd 4:2:0 dimensions
fn round_even(value: f64) -> u32 {
    let even = ((value / 2.0).round() * 2.0) as u32;
    even.max(2)
}

/// Output size estimation from bitrates and duration
pub struct SizeEstimator;

impl SizeEstimator {
    /// Estimated bytes for the given bitrates over `duration`; 0 when either
    /// bitrate is unknown or zero
    pub fn estimated_output_size(
        audio_bit_rate: Option<u64>,
        video_bit_rate: Option<u64>,
        duration: TimeSpec,
    ) -> u64 {
        match (audio_bit_rate, video_bit_rate) {
            (Some(audio), Some(video)) if audio > 0 && video > 0 => {
                let bytes_per_second = (audio + video) as f64 / 8.0;
                (bytes_per_second * duration.seconds.max(0.0)) as u64
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests;
