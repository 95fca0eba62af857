// In-memory media backend - deterministic synthetic reader and recording writer
//
// The reader synthesises frames and PCM from an `AssetInfo`; the writer records
// what it was given and, on finalize, writes a JSON summary to the output path.
// A `MemoryScript` injects failures, early end-of-stream and pacing.

mod reader;
mod writer;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::model::{
    AffineTransform, AssetInfo, AudioTrackInfo, ContainerKind, Size, TimeRange, TimeSpec, TrackKind,
    VideoTrackInfo,
};
use crate::domain::orientation::Rotation;
use crate::error::{ExportError, ExportResult};
use crate::ports::{MediaBackend, MediaReader, MediaWriter, OutputRequest, WriterOptions};

pub use reader::MemoryReader;
pub use writer::{MemoryWriter, TrackRecord, WriterRecord};

/// PCM frames per synthetic audio sample
pub const DEFAULT_AUDIO_CHUNK_FRAMES: usize = 1024;

/// Appends an input takes before it wants a readiness round trip
pub const DEFAULT_READY_BURST: usize = 8;

/// Scripted behaviour of the in-memory backend
#[derive(Debug, Clone)]
pub struct MemoryScript {
    pub fail_open_reader: Option<String>,
    pub fail_open_writer: Option<String>,
    /// Blocking delay inside `open_reader`
    pub open_delay: Option<Duration>,
    pub fail_start_reading: Option<String>,
    pub fail_start_writing: Option<String>,
    /// Reader fails once this track has produced that many samples
    pub read_failure_after: Option<(TrackKind, u64)>,
    /// Writer fails once this track has accepted that many samples
    pub write_failure_after: Option<(TrackKind, u64)>,
    /// Reader stops producing for this track after that many samples, without failing
    pub stall_after: Option<(TrackKind, u64)>,
    pub fail_finish: Option<String>,
    /// Blocking delay per produced sample
    pub sample_delay: Option<Duration>,
    /// Delay before each readiness wait resolves
    pub readiness_delay: Option<Duration>,
    pub ready_burst: usize,
    pub audio_chunk_frames: usize,
    /// Capacity of the pool the writer offers for hook frames; `None` lets the engine bring its own
    pub writer_pool_capacity: Option<usize>,
}

impl Default for MemoryScript {
    fn default() -> Self {
        Self {
            fail_open_reader: None,
            fail_open_writer: None,
            open_delay: None,
            fail_start_reading: None,
            fail_start_writing: None,
            read_failure_after: None,
            write_failure_after: None,
            stall_after: None,
            fail_finish: None,
            sample_delay: None,
            readiness_delay: None,
            ready_burst: DEFAULT_READY_BURST,
            audio_chunk_frames: DEFAULT_AUDIO_CHUNK_FRAMES,
            writer_pool_capacity: None,
        }
    }
}

impl MemoryScript {
    pub fn fail_open_reader(mut self, message: impl Into<String>) -> Self {
        self.fail_open_reader = Some(message.into());
        self
    }

    pub fn fail_open_writer(mut self, message: impl Into<String>) -> Self {
        self.fail_open_writer = Some(message.into());
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn read_failure_after(mut self, kind: TrackKind, samples: u64) -> Self {
        self.read_failure_after = Some((kind, samples));
        self
    }

    pub fn write_failure_after(mut self, kind: TrackKind, samples: u64) -> Self {
        self.write_failure_after = Some((kind, samples));
        self
    }

    pub fn stall_after(mut self, kind: TrackKind, samples: u64) -> Self {
        self.stall_after = Some((kind, samples));
        self
    }

    pub fn fail_finish(mut self, message: impl Into<String>) -> Self {
        self.fail_finish = Some(message.into());
        self
    }

    pub fn sample_delay(mut self, delay: Duration) -> Self {
        self.sample_delay = Some(delay);
        self
    }

    pub fn readiness_delay(mut self, delay: Duration) -> Self {
        self.readiness_delay = Some(delay);
        self
    }

    pub fn ready_burst(mut self, burst: usize) -> Self {
        self.ready_burst = burst.max(1);
        self
    }

    pub fn writer_pool_capacity(mut self, capacity: usize) -> Self {
        self.writer_pool_capacity = Some(capacity);
        self
    }
}

/// In-memory implementation of [`MediaBackend`]
#[derive(Default)]
pub struct MemoryBackend {
    script: MemoryScript,
    reader_opens: AtomicUsize,
    writer_opens: AtomicUsize,
    readers: Mutex<Vec<Arc<MemoryReader>>>,
    writers: Mutex<Vec<Arc<MemoryWriter>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: MemoryScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn reader_opens(&self) -> usize {
        self.reader_opens.load(Ordering::Acquire)
    }

    pub fn writer_opens(&self) -> usize {
        self.writer_opens.load(Ordering::Acquire)
    }

    /// Outputs requested from the most recently opened reader
    pub fn last_output_requests(&self) -> Vec<OutputRequest> {
        match self.readers.lock() {
            Ok(readers) => readers.last().map(|r| r.requests()).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Record of the most recently opened writer
    pub fn last_writer_record(&self) -> Option<WriterRecord> {
        self.writers.lock().ok()?.last().map(|writer| writer.record())
    }
}

impl MediaBackend for MemoryBackend {
    fn open_reader(
        &self,
        asset: &AssetInfo,
        time_range: &TimeRange,
    ) -> ExportResult<Arc<dyn MediaReader>> {
        self.reader_opens.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.script.open_delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = &self.script.fail_open_reader {
            return Err(ExportError::open(asset.source.clone(), message.clone()));
        }
        let reader = Arc::new(MemoryReader::new(
            asset.clone(),
            *time_range,
            self.script.clone(),
        ));
        if let Ok(mut readers) = self.readers.lock() {
            readers.push(Arc::clone(&reader));
        }
        Ok(reader)
    }

    fn open_writer(
        &self,
        destination: &Path,
        container: ContainerKind,
        options: &WriterOptions,
    ) -> ExportResult<Arc<dyn MediaWriter>> {
        self.writer_opens.fetch_add(1, Ordering::AcqRel);
        if let Some(message) = &self.script.fail_open_writer {
            return Err(ExportError::open(
                destination.display().to_string(),
                message.clone(),
            ));
        }
        let writer = Arc::new(MemoryWriter::create(
            destination,
            container,
            options.clone(),
            self.script.clone(),
        )?);
        if let Ok(mut writers) = self.writers.lock() {
            writers.push(Arc::clone(&writer));
        }
        Ok(writer)
    }
}

/// Synthetic asset with one video track and optionally one stereo audio track
pub fn synthetic_asset(
    duration_seconds: f64,
    natural_size: Size,
    rotation: Rotation,
    frame_rate: f64,
    with_audio: bool,
) -> AssetInfo {
    let transform: AffineTransform = rotation.correction_transform(natural_size);
    let mut asset = AssetInfo::new("memory://synthetic", TimeSpec::from_seconds(duration_seconds))
        .with_video_track(VideoTrackInfo::new(1, natural_size, frame_rate).with_transform(transform));
    if with_audio {
        asset = asset.with_audio_track(AudioTrackInfo::new(2, 44_100, 2));
    }
    asset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::media::PixelFormat;
    use crate::domain::settings::{AudioOutputSettings, AudioSettings, VideoOutputSettings};
    use crate::ports::InputRequest;
    use tempfile::TempDir;

    fn video_request(asset: &AssetInfo) -> OutputRequest {
        OutputRequest::VideoTrack {
            track: asset.video_tracks[0].clone(),
            settings: VideoOutputSettings::default(),
        }
    }

    #[test]
    fn test_reader_produces_frames_over_time_range() {
        let asset = synthetic_asset(1.0, Size::new(16, 8), Rotation::Deg0, 10.0, false);
        let range = TimeRange::new(TimeSpec::from_seconds(0.5), None).unwrap();
        let backend = MemoryBackend::new();
        let reader = backend.open_reader(&asset, &range).unwrap();
        let output = reader.add_output(video_request(&asset)).unwrap();
        assert!(reader.start_reading());

        let mut times = Vec::new();
        while let Some(sample) = output.copy_next_sample() {
            let image = sample.image_buffer().unwrap();
            assert_eq!(image.format, PixelFormat::Nv12);
            assert_eq!(image.size(), Size::new(16, 8));
            times.push(sample.presentation_time.seconds);
        }
        assert_eq!(times.len(), 5);
        assert!((times[0] - 0.5).abs() < 1e-9);
        assert!(times.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_read_failure_sets_reader_status() {
        let asset = synthetic_asset(1.0, Size::new(16, 8), Rotation::Deg0, 10.0, false);
        let backend = MemoryBackend::with_script(
            MemoryScript::default().read_failure_after(TrackKind::Video, 3),
        );
        let reader = backend.open_reader(&asset, &TimeRange::full()).unwrap();
        let output = reader.add_output(video_request(&asset)).unwrap();
        reader.start_reading();

        let mut count = 0;
        while output.copy_next_sample().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(reader.status(), crate::domain::model::MediaStatus::Failed);
        assert!(reader.error().is_some());
    }

    #[test]
    fn test_audio_mix_sums_tracks_with_volume() {
        let asset = AssetInfo::new("memory://mix", TimeSpec::from_seconds(0.1))
            .with_audio_track(AudioTrackInfo::new(1, 44_100, 2))
            .with_audio_track(AudioTrackInfo::new(2, 44_100, 2));
        let backend = MemoryBackend::new();
        let reader = backend.open_reader(&asset, &TimeRange::full()).unwrap();
        let output = reader
            .add_output(OutputRequest::AudioMix {
                tracks: asset.audio_tracks.clone(),
                mix: crate::domain::composition::AudioMix::default().with_track(2, 0.5),
                settings: AudioOutputSettings::default(),
            })
            .unwrap();
        reader.start_reading();

        let sample = output.copy_next_sample().unwrap();
        match sample.payload {
            crate::domain::media::SamplePayload::Audio(audio) => {
                assert_eq!(audio.channels, 2);
                assert_eq!(audio.samples[0], reader::SYNTHETIC_LEVEL + reader::SYNTHETIC_LEVEL / 2);
            }
            _ => panic!("expected audio"),
        }
    }

    #[tokio::test]
    async fn test_writer_records_and_writes_summary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mp4");
        let backend = MemoryBackend::new();
        let writer = backend
            .open_writer(&path, ContainerKind::Mp4, &WriterOptions::default())
            .unwrap();
        let input = writer
            .add_input(InputRequest::Audio {
                settings: AudioSettings::default(),
            })
            .unwrap();
        assert!(writer.start_writing());
        writer.start_session(TimeSpec::zero());

        let sample = crate::domain::media::SampleBuffer::audio(
            TimeSpec::zero(),
            crate::domain::media::AudioBuffer::silence(44_100, 2, 1024),
        );
        assert!(input.append_sample(sample));
        input.mark_as_finished();
        writer.finish_writing().await.unwrap();

        let record = backend.last_writer_record().unwrap();
        assert_eq!(record.tracks.len(), 1);
        assert_eq!(record.tracks[0].samples, 1);
        assert!(record.tracks[0].finished);
        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(summary["container"], "mp4");
    }

    #[test]
    fn test_open_failures_are_counted() {
        let backend = MemoryBackend::with_script(MemoryScript::default().fail_open_reader("gone"));
        let asset = synthetic_asset(1.0, Size::new(16, 8), Rotation::Deg0, 10.0, false);
        assert!(backend.open_reader(&asset, &TimeRange::full()).is_err());
        assert_eq!(backend.reader_opens(), 1);
        assert_eq!(backend.writer_opens(), 0);
    }
}
