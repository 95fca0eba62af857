// Decoded media payloads moved between reader outputs and writer inputs

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::model::{Size, TimeSpec, TrackKind};

/// Pixel layouts the pipeline knows how to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit B, G, R, A
    Bgra,
    /// 4:2:0 bi-planar, video range
    Nv12,
    /// 4:2:0 tri-planar
    Yuv420p,
}

impl PixelFormat {
    /// Bytes per pixel of the packed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Bgra => Some(4),
            PixelFormat::Nv12 | PixelFormat::Yuv420p => None,
        }
    }

    /// Row stride of the first plane
    pub fn stride(&self, width: u32) -> usize {
        match self {
            PixelFormat::Bgra => width as usize * 4,
            PixelFormat::Nv12 | PixelFormat::Yuv420p => width as usize,
        }
    }

    /// Total byte length of one frame at the given size
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Bgra => w * h * 4,
            PixelFormat::Nv12 | PixelFormat::Yuv420p => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgra => "bgra",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv420p => "yuv420p",
        };
        write!(f, "{}", name)
    }
}

/// Receives frame storage back when a pooled [`PixelBuffer`] is dropped
pub trait FrameRecycler: Send + Sync {
    fn recycle(&self, data: Vec<u8>);
}

/// One image plane set, optionally leased from a pool.
///
/// When the buffer came from a pool its storage goes back to that pool on drop,
/// so downstream stages can reuse memory without reallocating per frame.
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
    data: Vec<u8>,
    recycler: Option<Arc<dyn FrameRecycler>>,
}

impl PixelBuffer {
    /// Zero-filled buffer not attached to any pool
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::from_data(width, height, format, vec![0; format.frame_len(width, height)])
    }

    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            stride: format.stride(width),
            data,
            recycler: None,
        }
    }

    /// Buffer whose storage returns to `recycler` on drop
    pub fn pooled(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        recycler: Arc<dyn FrameRecycler>,
    ) -> Self {
        let mut buffer = Self::from_data(width, height, format, data);
        buffer.recycler = Some(recycler);
        buffer
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_pooled(&self) -> bool {
        self.recycler.is_some()
    }

    /// Fill every BGRA pixel with one colour
    pub fn fill_bgra(&mut self, pixel: [u8; 4]) {
        if self.format != PixelFormat::Bgra {
            return;
        }
        for chunk in self.data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }

    /// Read one BGRA pixel, `None` outside the frame or for planar formats
    pub fn bgra_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.format != PixelFormat::Bgra || x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride + x as usize * 4;
        let px = self.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

impl Clone for PixelBuffer {
    /// Clones are detached copies; only the original returns storage to the pool
    fn clone(&self) -> Self {
        Self::from_data(self.width, self.height, self.format, self.data.clone())
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            recycler.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// Interleaved signed 16-bit PCM
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioBuffer {
    pub fn silence(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self {
            sample_rate,
            channels,
            samples: vec![0; frames * channels as usize],
        }
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> TimeSpec {
        if self.sample_rate == 0 {
            return TimeSpec::zero();
        }
        TimeSpec::from_seconds(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Scale every sample by `volume`, saturating at the i16 range
    pub fn apply_volume(&mut self, volume: f32) {
        if (volume - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in &mut self.samples {
            let scaled = (*sample as f32 * volume).round();
            *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    /// Add `other` into this buffer sample by sample, saturating
    pub fn mix_in(&mut self, other: &AudioBuffer) {
        if self.samples.len() < other.samples.len() {
            self.samples.resize(other.samples.len(), 0);
        }
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst = dst.saturating_add(*src);
        }
    }
}

#[derive(Debug, Clone)]
pub enum SamplePayload {
    Image(PixelBuffer),
    Audio(AudioBuffer),
}

/// One decoded unit of media carrying its presentation timestamp
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub presentation_time: TimeSpec,
    pub duration: TimeSpec,
    pub payload: SamplePayload,
}

impl SampleBuffer {
    pub fn image(presentation_time: TimeSpec, duration: TimeSpec, image: PixelBuffer) -> Self {
        Self {
            presentation_time,
            duration,
            payload: SamplePayload::Image(image),
        }
    }

    pub fn audio(presentation_time: TimeSpec, audio: AudioBuffer) -> Self {
        Self {
            presentation_time,
            duration: audio.duration(),
            payload: SamplePayload::Audio(audio),
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self.payload {
            SamplePayload::Image(_) => TrackKind::Video,
            SamplePayload::Audio(_) => TrackKind::Audio,
        }
    }

    pub fn image_buffer(&self) -> Option<&PixelBuffer> {
        match &self.payload {
            SamplePayload::Image(image) => Some(image),
            SamplePayload::Audio(_) => None,
        }
    }

    /// Same sample stamped at a new presentation time
    pub fn retimed(mut self, presentation_time: TimeSpec) -> Self {
        self.presentation_time = presentation_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingRecycler {
        returned: Mutex<Vec<usize>>,
    }

    impl FrameRecycler for CollectingRecycler {
        fn recycle(&self, data: Vec<u8>) {
            self.returned.lock().unwrap().push(data.len());
        }
    }

    #[test]
    fn test_frame_len_by_format() {
        assert_eq!(PixelFormat::Bgra.frame_len(4, 2), 32);
        assert_eq!(PixelFormat::Nv12.frame_len(4, 2), 12);
        assert_eq!(PixelFormat::Yuv420p.frame_len(3, 3), 9 + 8);
    }

    #[test]
    fn test_pooled_buffer_returns_storage_on_drop() {
        let recycler = Arc::new(CollectingRecycler::default());
        let buffer = PixelBuffer::pooled(2, 2, PixelFormat::Bgra, vec![0; 16], recycler.clone());
        let copy = buffer.clone();
        assert!(!copy.is_pooled());
        drop(copy);
        assert!(recycler.returned.lock().unwrap().is_empty());
        drop(buffer);
        assert_eq!(*recycler.returned.lock().unwrap(), vec![16]);
    }

    #[test]
    fn test_bgra_access() {
        let mut buffer = PixelBuffer::new(2, 2, PixelFormat::Bgra);
        buffer.fill_bgra([1, 2, 3, 255]);
        assert_eq!(buffer.bgra_at(1, 1), Some([1, 2, 3, 255]));
        assert_eq!(buffer.bgra_at(2, 0), None);
    }

    #[test]
    fn test_audio_volume_and_mix() {
        let mut a = AudioBuffer {
            sample_rate: 44_100,
            channels: 2,
            samples: vec![100, -100, i16::MAX, 0],
        };
        a.apply_volume(2.0);
        assert_eq!(a.samples, vec![200, -200, i16::MAX, 0]);

        let b = AudioBuffer {
            sample_rate: 44_100,
            channels: 2,
            samples: vec![1, 1, 1, 1, 5, 5],
        };
        a.mix_in(&b);
        assert_eq!(a.samples, vec![201, -199, i16::MAX, 1, 5, 5]);
        assert_eq!(a.frames(), 3);
    }

    #[test]
    fn test_sample_retime_keeps_payload() {
        let sample = SampleBuffer::audio(
            TimeSpec::from_seconds(5.0),
            AudioBuffer::silence(1000, 1, 500),
        );
        assert_eq!(sample.duration.seconds, 0.5);
        let shifted = sample.retimed(TimeSpec::from_seconds(1.0));
        assert_eq!(shifted.presentation_time.seconds, 1.0);
        assert_eq!(shifted.kind(), TrackKind::Audio);
    }
}
