// Typed per-track encode and decode settings

use serde::{Deserialize, Serialize};

use crate::domain::media::PixelFormat;
use crate::domain::model::Size;
use crate::error::{ExportError, ExportResult};

/// Frame rate the encoder is told to expect when nothing better is known
pub const DEFAULT_EXPECTED_FRAME_RATE: f64 = 30.0;

pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_AUDIO_CHANNELS: u16 = 2;
pub const DEFAULT_AUDIO_BIT_RATE: u64 = 128_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

impl VideoCodec {
    /// Encoder name understood by libavcodec
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLevel {
    Baseline,
    Main,
    #[default]
    HighAutoLevel,
}

impl ProfileLevel {
    pub fn x264_profile(&self) -> &'static str {
        match self {
            ProfileLevel::Baseline => "baseline",
            ProfileLevel::Main => "main",
            ProfileLevel::HighAutoLevel => "high",
        }
    }
}

/// How the source picture is fitted into the encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    Fit,
    #[default]
    ResizeAspectFill,
    Resize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorPrimaries {
    #[default]
    Bt709,
    Bt601,
    Bt2020,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoCompressionProperties {
    pub average_bit_rate: u64,
    pub profile_level: ProfileLevel,
    pub allow_frame_reordering: bool,
    pub expected_source_frame_rate: f64,
    /// Frame rate of the composition when set; the track's nominal rate otherwise
    pub average_non_droppable_frame_rate: Option<f64>,
    pub color_primaries: ColorPrimaries,
}

impl VideoCompressionProperties {
    pub fn with_bit_rate(average_bit_rate: u64) -> Self {
        Self {
            average_bit_rate,
            profile_level: ProfileLevel::default(),
            allow_frame_reordering: false,
            expected_source_frame_rate: DEFAULT_EXPECTED_FRAME_RATE,
            average_non_droppable_frame_rate: None,
            color_primaries: ColorPrimaries::default(),
        }
    }
}

/// Encoder settings for the video writer input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub scaling_mode: ScalingMode,
    pub compression: VideoCompressionProperties,
}

impl VideoSettings {
    pub fn new(size: Size, average_bit_rate: u64) -> Self {
        Self {
            codec: VideoCodec::default(),
            width: size.width,
            height: size.height,
            scaling_mode: ScalingMode::default(),
            compression: VideoCompressionProperties::with_bit_rate(average_bit_rate),
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Frame rate requested for a composition built for these settings
    pub fn target_frame_rate(&self) -> Option<f64> {
        self.compression.average_non_droppable_frame_rate
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ExportError::configuration(format!(
                "Video dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.compression.average_bit_rate == 0 {
            return Err(ExportError::configuration("Video bit rate must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Aac,
    LinearPcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    #[default]
    Stereo,
}

impl ChannelLayout {
    pub fn for_channels(channels: u16) -> Self {
        if channels == 1 {
            ChannelLayout::Mono
        } else {
            ChannelLayout::Stereo
        }
    }
}

/// Encoder settings for the audio writer input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub format: AudioFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_rate: u64,
    pub channel_layout: ChannelLayout,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::Aac,
            channels: DEFAULT_AUDIO_CHANNELS,
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            bit_rate: DEFAULT_AUDIO_BIT_RATE,
            channel_layout: ChannelLayout::Stereo,
        }
    }
}

impl AudioSettings {
    pub fn validate(&self) -> ExportResult<()> {
        if self.channels == 0 {
            return Err(ExportError::configuration("Audio channel count must be non-zero"));
        }
        if self.sample_rate == 0 {
            return Err(ExportError::configuration("Audio sample rate must be non-zero"));
        }
        if self.format == AudioFormat::Aac && self.bit_rate == 0 {
            return Err(ExportError::configuration("AAC bit rate must be non-zero"));
        }
        Ok(())
    }
}

/// Decode format the reader produces for video samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOutputSettings {
    pub pixel_format: PixelFormat,
}

impl Default for VideoOutputSettings {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Nv12,
        }
    }
}

/// Decode format the reader produces for audio samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOutputSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub big_endian: bool,
    pub float: bool,
    pub interleaved: bool,
}

impl Default for AudioOutputSettings {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            channels: DEFAULT_AUDIO_CHANNELS,
            bit_depth: 16,
            big_endian: false,
            float: false,
            interleaved: true,
        }
    }
}

/// Attributes of the buffers handed to the per-frame hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBufferAttributes {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl PixelBufferAttributes {
    pub fn bgra(size: Size) -> Self {
        Self {
            pixel_format: PixelFormat::Bgra,
            width: size.width,
            height: size.height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_settings_defaults() {
        let settings = VideoSettings::new(Size::new(720, 1280), 3_500_000);
        assert_eq!(settings.codec, VideoCodec::H264);
        assert_eq!(settings.scaling_mode, ScalingMode::ResizeAspectFill);
        assert_eq!(settings.compression.profile_level, ProfileLevel::HighAutoLevel);
        assert!(!settings.compression.allow_frame_reordering);
        assert_eq!(settings.compression.expected_source_frame_rate, 30.0);
        assert_eq!(settings.compression.color_primaries, ColorPrimaries::Bt709);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_target_frame_rate_comes_from_non_droppable_rate() {
        let mut settings = VideoSettings::new(Size::new(640, 480), 1_000_000);
        assert_eq!(settings.target_frame_rate(), None);

        settings.compression.average_non_droppable_frame_rate = Some(24.0);
        assert_eq!(settings.target_frame_rate(), Some(24.0));
    }

    #[test]
    fn test_audio_settings_validation() {
        assert!(AudioSettings::default().validate().is_ok());

        let mut settings = AudioSettings::default();
        settings.channels = 0;
        assert!(settings.validate().is_err());

        let mut settings = AudioSettings::default();
        settings.sample_rate = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_reader_output_defaults() {
        assert_eq!(VideoOutputSettings::default().pixel_format, PixelFormat::Nv12);
        let audio = AudioOutputSettings::default();
        assert_eq!((audio.sample_rate, audio.channels, audio.bit_depth), (44_100, 2, 16));
        assert!(!audio.big_endian && !audio.float && audio.interleaved);
    }
}
