// Orientation-correcting video composition and audio mix descriptions

use serde::{Deserialize, Serialize};

use crate::domain::media::{PixelBuffer, PixelFormat};
use crate::domain::model::{AffineTransform, Size, TimeRange, TimeSpec, VideoTrackInfo};
use crate::domain::orientation::{rotation_of, Rotation};
use crate::error::{ExportError, ExportResult};

pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Pixel written where the inverse mapping lands outside the source frame
const BACKGROUND_BGRA: [u8; 4] = [0, 0, 0, 255];

/// Per-track transform inside one instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInstruction {
    pub track_id: u32,
    pub transform: AffineTransform,
}

/// Layer transforms applied over one span of the output timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionInstruction {
    pub time_range: TimeRange,
    pub layers: Vec<LayerInstruction>,
}

impl CompositionInstruction {
    pub fn covers(&self, time: TimeSpec) -> bool {
        self.time_range.contains(time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoComposition {
    pub render_size: Size,
    pub frame_rate: f64,
    pub instructions: Vec<CompositionInstruction>,
}

impl VideoComposition {
    /// Duration of one output frame
    pub fn frame_duration(&self) -> TimeSpec {
        TimeSpec::from_seconds(1.0 / self.frame_rate)
    }

    fn transform_at(&self, time: TimeSpec) -> AffineTransform {
        self.instructions
            .iter()
            .find(|instruction| instruction.covers(time))
            .and_then(|instruction| instruction.layers.first())
            .map(|layer| layer.transform)
            .unwrap_or_default()
    }

    /// Render `src` upright at render size
    pub fn render_frame(&self, src: &PixelBuffer, time: TimeSpec) -> ExportResult<PixelBuffer> {
        let mut dst = PixelBuffer::new(self.render_size.width, self.render_size.height, PixelFormat::Bgra);
        self.render_into(src, time, &mut dst)?;
        Ok(dst)
    }

    /// Render `src` into an existing BGRA frame of render size.
    ///
    /// Each destination pixel centre is mapped back through the inverse layer
    /// transform and takes the nearest source pixel.
    pub fn render_into(&self, src: &PixelBuffer, time: TimeSpec, dst: &mut PixelBuffer) -> ExportResult<()> {
        if src.format != PixelFormat::Bgra || dst.format != PixelFormat::Bgra {
            return Err(ExportError::read(format!(
                "Composition rendering needs bgra frames, got {} -> {}",
                src.format, dst.format
            )));
        }
        if dst.size() != self.render_size {
            return Err(ExportError::read(format!(
                "Destination frame is {}, composition renders at {}",
                dst.size(),
                self.render_size
            )));
        }
        let inverse = self
            .transform_at(time)
            .inverse()
            .ok_or_else(|| ExportError::read("Composition layer transform is not invertible"))?;

        let (src_w, src_h) = (src.width as i64, src.height as i64);
        let src_stride = src.stride;
        let dst_stride = dst.stride;
        let src_data = src.data();
        let dst_data = dst.data_mut();
        for y in 0..self.render_size.height as usize {
            for x in 0..self.render_size.width as usize {
                let (sx, sy) = inverse.apply(x as f64 + 0.5, y as f64 + 0.5);
                let (sx, sy) = (sx.floor() as i64, sy.floor() as i64);
                let out = y * dst_stride + x * 4;
                let pixel = if sx >= 0 && sy >= 0 && sx < src_w && sy < src_h {
                    let at = sy as usize * src_stride + sx as usize * 4;
                    src_data.get(at..at + 4).unwrap_or(&BACKGROUND_BGRA)
                } else {
                    &BACKGROUND_BGRA
                };
                if let Some(slot) = dst_data.get_mut(out..out + 4) {
                    slot.copy_from_slice(pixel);
                }
            }
        }
        Ok(())
    }
}

/// Frame rate for a composition: the requested target, else the track's
/// nominal rate; anything non-positive falls back to 30
pub fn composition_frame_rate(target: Option<f64>, nominal: f64) -> f64 {
    let rate = target.unwrap_or(nominal);
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        DEFAULT_FRAME_RATE
    }
}

/// Composition that turns `track` upright over the whole asset.
///
/// Returns `None` when the track needs no correction, so the raw track can be
/// read without a render pass.
pub fn build_default_composition(
    track: &VideoTrackInfo,
    asset_duration: TimeSpec,
    target_frame_rate: Option<f64>,
) -> Option<VideoComposition> {
    let rotation = rotation_of(&track.preferred_transform);
    if rotation == Rotation::Deg0 {
        return None;
    }
    Some(VideoComposition {
        render_size: rotation.render_size(track.natural_size),
        frame_rate: composition_frame_rate(target_frame_rate, track.nominal_frame_rate),
        instructions: vec![CompositionInstruction {
            time_range: TimeRange {
                start: TimeSpec::zero(),
                duration: Some(asset_duration),
            },
            layers: vec![LayerInstruction {
                track_id: track.track_id,
                transform: rotation.correction_transform(track.natural_size),
            }],
        }],
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMixTrack {
    pub track_id: u32,
    pub volume: f32,
}

/// Per-track volumes for mixing every audio track into one output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioMix {
    pub tracks: Vec<AudioMixTrack>,
}

impl AudioMix {
    pub fn with_track(mut self, track_id: u32, volume: f32) -> Self {
        self.tracks.push(AudioMixTrack { track_id, volume });
        self
    }

    /// Volume for a track; tracks not listed play at unity gain
    pub fn volume_for(&self, track_id: u32) -> f32 {
        self.tracks
            .iter()
            .find(|track| track.track_id == track_id)
            .map(|track| track.volume)
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_track(rotation: Rotation, size: Size) -> VideoTrackInfo {
        VideoTrackInfo::new(1, size, 29.97).with_transform(rotation.correction_transform(size))
    }

    #[test]
    fn test_no_composition_without_rotation() {
        let track = VideoTrackInfo::new(1, Size::new(1920, 1080), 30.0);
        assert!(build_default_composition(&track, TimeSpec::from_seconds(10.0), None).is_none());
    }

    #[test]
    fn test_render_size_follows_rotation() {
        let natural = Size::new(1920, 1080);
        let duration = TimeSpec::from_seconds(10.0);

        let quarter = build_default_composition(&rotated_track(Rotation::Deg90, natural), duration, None).unwrap();
        assert_eq!(quarter.render_size, Size::new(1080, 1920));

        let half = build_default_composition(&rotated_track(Rotation::Deg180, natural), duration, None).unwrap();
        assert_eq!(half.render_size, natural);
    }

    #[test]
    fn test_instruction_spans_asset() {
        let composition = build_default_composition(
            &rotated_track(Rotation::Deg270, Size::new(640, 480)),
            TimeSpec::from_seconds(4.0),
            None,
        )
        .unwrap();
        assert_eq!(composition.instructions.len(), 1);
        let instruction = &composition.instructions[0];
        assert_eq!(instruction.time_range.start, TimeSpec::zero());
        assert_eq!(instruction.time_range.duration, Some(TimeSpec::from_seconds(4.0)));
        assert_eq!(instruction.layers[0].track_id, 1);
    }

    #[test]
    fn test_frame_rate_selection() {
        assert_eq!(composition_frame_rate(Some(24.0), 29.97), 24.0);
        assert_eq!(composition_frame_rate(None, 29.97), 29.97);
        assert_eq!(composition_frame_rate(None, 0.0), DEFAULT_FRAME_RATE);
        assert_eq!(composition_frame_rate(Some(0.0), 25.0), DEFAULT_FRAME_RATE);
        assert_eq!(composition_frame_rate(Some(f64::NAN), 25.0), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_render_quarter_turn_moves_corner_pixel() {
        let natural = Size::new(4, 2);
        let composition = build_default_composition(
            &rotated_track(Rotation::Deg90, natural),
            TimeSpec::from_seconds(1.0),
            None,
        )
        .unwrap();

        let mut src = PixelBuffer::new(4, 2, PixelFormat::Bgra);
        src.fill_bgra([10, 10, 10, 255]);
        src.data_mut()[0..4].copy_from_slice(&[200, 0, 0, 255]);

        let out = composition.render_frame(&src, TimeSpec::zero()).unwrap();
        assert_eq!(out.size(), Size::new(2, 4));
        // top-left source pixel lands at the top-right after a quarter turn
        assert_eq!(out.bgra_at(1, 0), Some([200, 0, 0, 255]));
        assert_eq!(out.bgra_at(0, 0), Some([10, 10, 10, 255]));
    }

    #[test]
    fn test_render_rejects_planar_source() {
        let composition = build_default_composition(
            &rotated_track(Rotation::Deg180, Size::new(4, 2)),
            TimeSpec::from_seconds(1.0),
            None,
        )
        .unwrap();
        let src = PixelBuffer::new(4, 2, PixelFormat::Nv12);
        assert!(composition.render_frame(&src, TimeSpec::zero()).is_err());
    }

    #[test]
    fn test_audio_mix_volume_lookup() {
        let mix = AudioMix::default().with_track(2, 0.5);
        assert_eq!(mix.volume_for(2), 0.5);
        assert_eq!(mix.volume_for(3), 1.0);
    }
}
