//! LibAV backend using the ffmpeg-next bindings
//!
//! Probing happens on the calling thread. Every reader output and every
//! writer owns a dedicated thread holding its libav contexts, so none of the
//! raw contexts ever cross threads; samples travel over channels.

mod reader;
mod writer;

use std::path::Path;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::media::Type as MediaType;
use ffmpeg::util::frame;
use tracing::{debug, info};

use crate::domain::media::{PixelBuffer, PixelFormat};
use crate::domain::model::{
    AssetInfo, AudioTrackInfo, ContainerKind, Size, TimeRange, TimeSpec, VideoTrackInfo,
};
use crate::domain::orientation::Rotation;
use crate::error::{ExportError, ExportResult};
use crate::ports::{MediaBackend, MediaReader, MediaWriter, WriterOptions};

pub use reader::LibavReader;
pub use writer::LibavWriter;

/// Media backend decoding and encoding through libav
pub struct LibavBackend {
    thread_count: usize,
}

impl LibavBackend {
    pub fn new() -> ExportResult<Self> {
        ffmpeg::init().map_err(|e| ExportError::Probe {
            message: format!("FFmpeg initialization failed: {}", e),
        })?;
        Ok(Self {
            thread_count: Self::optimize_thread_count(),
        })
    }

    /// Codec threads per decoder/encoder: three quarters of the cores, 1..=16
    fn optimize_thread_count() -> usize {
        let cpu_count = num_cpus::get();
        let optimal_threads = (cpu_count as f64 * 0.75).ceil() as usize;
        optimal_threads.clamp(1, 16)
    }
}

impl MediaBackend for LibavBackend {
    fn open_reader(
        &self,
        asset: &AssetInfo,
        time_range: &TimeRange,
    ) -> ExportResult<Arc<dyn MediaReader>> {
        let path = Path::new(&asset.source);
        // open once up front so a missing or unreadable source fails here
        ffmpeg::format::input(&path)
            .map_err(|e| ExportError::open(asset.source.clone(), e.to_string()))?;
        Ok(Arc::new(LibavReader::new(
            path.to_path_buf(),
            asset.clone(),
            *time_range,
            self.thread_count,
        )))
    }

    fn open_writer(
        &self,
        destination: &Path,
        container: ContainerKind,
        options: &WriterOptions,
    ) -> ExportResult<Arc<dyn MediaWriter>> {
        std::fs::File::create(destination).map_err(|e| {
            ExportError::open(destination.display().to_string(), e.to_string())
        })?;
        Ok(Arc::new(LibavWriter::new(
            destination.to_path_buf(),
            container,
            options.clone(),
            self.thread_count,
        )))
    }
}

/// Describe the tracks of a media file
pub fn probe_asset(path: &Path) -> ExportResult<AssetInfo> {
    ffmpeg::init()?;
    if !path.exists() {
        return Err(ExportError::Probe {
            message: format!("File does not exist: {}", path.display()),
        });
    }
    let ictx = ffmpeg::format::input(&path)?;

    let duration = if ictx.duration() > 0 {
        TimeSpec::from_ticks(ictx.duration(), ffmpeg::ffi::AV_TIME_BASE as u32)
    } else {
        TimeSpec::zero()
    };
    let mut asset = AssetInfo::new(path.display().to_string(), duration);

    for stream in ictx.streams() {
        let parameters = stream.parameters();
        let track_id = stream.index() as u32;
        match parameters.medium() {
            MediaType::Video => {
                let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)?
                    .decoder()
                    .video()?;
                let natural_size = Size::new(decoder.width(), decoder.height());
                let rate = stream.avg_frame_rate();
                let frame_rate = if rate.denominator() != 0 {
                    f64::from(rate)
                } else {
                    0.0
                };
                let rotation = stream
                    .metadata()
                    .get("rotate")
                    .and_then(|value| value.trim().parse::<i64>().ok())
                    .and_then(Rotation::from_degrees)
                    .unwrap_or(Rotation::Deg0);
                let mut track = VideoTrackInfo::new(track_id, natural_size, frame_rate)
                    .with_transform(rotation.correction_transform(natural_size));
                track.codec = decoder
                    .codec()
                    .map(|codec| codec.name().to_string())
                    .unwrap_or_else(|| format!("{:?}", decoder.id()).to_lowercase());
                track.bit_rate = (decoder.bit_rate() > 0).then_some(decoder.bit_rate() as u64);
                debug!(track_id, size = %natural_size, frame_rate, rotation = %rotation, "probed video track");
                asset = asset.with_video_track(track);
            }
            MediaType::Audio => {
                let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)?
                    .decoder()
                    .audio()?;
                let channels = decoder.ch_layout().channels().max(0) as u16;
                let mut track = AudioTrackInfo::new(track_id, decoder.rate(), channels);
                track.codec = decoder
                    .codec()
                    .map(|codec| codec.name().to_string())
                    .unwrap_or_else(|| format!("{:?}", decoder.id()).to_lowercase());
                track.bit_rate = (decoder.bit_rate() > 0).then_some(decoder.bit_rate() as u64);
                debug!(track_id, sample_rate = track.sample_rate, channels, "probed audio track");
                asset = asset.with_audio_track(track);
            }
            _ => {}
        }
    }

    info!(
        path = %path.display(),
        duration = %duration,
        video_tracks = asset.video_tracks.len(),
        audio_tracks = asset.audio_tracks.len(),
        "probed asset"
    );
    Ok(asset)
}

pub(crate) fn av_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Yuv420p => Pixel::YUV420P,
    }
}

/// `(row bytes, rows)` of each plane of a tightly packed frame
fn plane_layout(format: PixelFormat, width: u32, height: u32) -> Vec<(usize, usize)> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    match format {
        PixelFormat::Bgra => vec![(w * 4, h)],
        PixelFormat::Nv12 => vec![(w, h), (cw * 2, ch)],
        PixelFormat::Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
    }
}

/// Copy a (possibly padded) libav frame into a tightly packed buffer
pub(crate) fn frame_to_buffer(source: &frame::Video, format: PixelFormat) -> PixelBuffer {
    let (width, height) = (source.width(), source.height());
    let mut data = Vec::with_capacity(format.frame_len(width, height));
    for (plane, (row_bytes, rows)) in plane_layout(format, width, height).into_iter().enumerate() {
        let stride = source.stride(plane);
        let bytes = source.data(plane);
        for row in 0..rows {
            let offset = row * stride;
            data.extend_from_slice(&bytes[offset..offset + row_bytes]);
        }
    }
    PixelBuffer::from_data(width, height, format, data)
}

/// Copy a tightly packed buffer into a libav frame of the same format and size
pub(crate) fn buffer_to_frame(source: &PixelBuffer, destination: &mut frame::Video) {
    let mut offset = 0;
    for (plane, (row_bytes, rows)) in plane_layout(source.format, source.width, source.height)
        .into_iter()
        .enumerate()
    {
        let stride = destination.stride(plane);
        let bytes = destination.data_mut(plane);
        for row in 0..rows {
            let start = row * stride;
            bytes[start..start + row_bytes]
                .copy_from_slice(&source.data()[offset..offset + row_bytes]);
            offset += row_bytes;
        }
    }
}

fn read_error(err: ffmpeg::Error) -> ExportError {
    ExportError::read(err.to_string())
}

fn write_error(err: ffmpeg::Error) -> ExportError {
    ExportError::write(err.to_string())
}
