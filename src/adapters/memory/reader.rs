use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::composition::{composition_frame_rate, AudioMix, VideoComposition};
use crate::domain::media::{AudioBuffer, PixelBuffer, PixelFormat, SampleBuffer};
use crate::domain::model::{AssetInfo, MediaStatus, Size, TimeRange, TimeSpec, TrackKind};
use crate::ports::{MediaReader, OutputRequest, ReaderOutput};

use super::MemoryScript;

/// Sample value every synthetic audio track carries before volume is applied
pub const SYNTHETIC_LEVEL: i16 = 1000;

pub struct MemoryReader {
    shared: Arc<ReaderShared>,
}

struct ReaderShared {
    asset: AssetInfo,
    start: TimeSpec,
    end: TimeSpec,
    script: MemoryScript,
    status: Mutex<MediaStatus>,
    error: Mutex<Option<String>>,
    started: AtomicBool,
    cancelled: AtomicBool,
    outputs: AtomicUsize,
    exhausted: AtomicUsize,
    requests: Mutex<Vec<OutputRequest>>,
}

impl ReaderShared {
    fn status(&self) -> MediaStatus {
        self.status.lock().map(|status| *status).unwrap_or(MediaStatus::Failed)
    }

    fn set_status(&self, status: MediaStatus) {
        if let Ok(mut current) = self.status.lock() {
            // terminal states stick
            if matches!(*current, MediaStatus::Unknown | MediaStatus::InProgress) {
                *current = status;
            }
        }
    }

    fn fail(&self, message: String) {
        if let Ok(mut error) = self.error.lock() {
            error.get_or_insert(message);
        }
        self.set_status(MediaStatus::Failed);
    }

    fn output_exhausted(&self) {
        let exhausted = self.exhausted.fetch_add(1, Ordering::AcqRel) + 1;
        if exhausted >= self.outputs.load(Ordering::Acquire) {
            self.set_status(MediaStatus::Completed);
        }
    }
}

impl MemoryReader {
    pub(super) fn new(asset: AssetInfo, time_range: TimeRange, script: MemoryScript) -> Self {
        let start = time_range.start;
        let requested_end = start + time_range.resolved_duration(asset.duration);
        let end = TimeSpec::from_seconds(requested_end.seconds.min(asset.duration.seconds));
        Self {
            shared: Arc::new(ReaderShared {
                asset,
                start,
                end,
                script,
                status: Mutex::new(MediaStatus::Unknown),
                error: Mutex::new(None),
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                outputs: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn requests(&self) -> Vec<OutputRequest> {
        self.shared
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn source_for(&self, request: &OutputRequest) -> Option<OutputSource> {
        let asset = &self.shared.asset;
        match request {
            OutputRequest::VideoTrack { track, settings } => {
                let track = asset
                    .video_tracks
                    .iter()
                    .find(|candidate| candidate.track_id == track.track_id)?;
                Some(OutputSource::Video {
                    natural_size: track.natural_size,
                    frame_size: track.natural_size,
                    frame_rate: composition_frame_rate(None, track.nominal_frame_rate),
                    composition: None,
                    pixel_format: settings.pixel_format,
                })
            }
            OutputRequest::VideoComposition {
                tracks,
                composition,
                settings,
            } => {
                let track = tracks.first()?;
                Some(OutputSource::Video {
                    natural_size: track.natural_size,
                    frame_size: composition.render_size,
                    frame_rate: composition_frame_rate(Some(composition.frame_rate), track.nominal_frame_rate),
                    composition: Some(composition.clone()),
                    pixel_format: settings.pixel_format,
                })
            }
            OutputRequest::AudioTrack { track, settings } => {
                asset
                    .audio_tracks
                    .iter()
                    .find(|candidate| candidate.track_id == track.track_id)?;
                Some(OutputSource::Audio {
                    volumes: vec![1.0],
                    sample_rate: settings.sample_rate,
                    channels: settings.channels,
                })
            }
            OutputRequest::AudioMix {
                tracks,
                mix,
                settings,
            } => {
                if tracks.is_empty() {
                    return None;
                }
                Some(OutputSource::Audio {
                    volumes: volumes_for(tracks.iter().map(|t| t.track_id), mix),
                    sample_rate: settings.sample_rate,
                    channels: settings.channels,
                })
            }
        }
    }
}

fn volumes_for(track_ids: impl Iterator<Item = u32>, mix: &AudioMix) -> Vec<f32> {
    track_ids.map(|id| mix.volume_for(id)).collect()
}

impl MediaReader for MemoryReader {
    fn add_output(&self, request: OutputRequest) -> Option<Arc<dyn ReaderOutput>> {
        if self.shared.started.load(Ordering::Acquire) {
            return None;
        }
        let source = self.source_for(&request)?;
        if let Ok(mut requests) = self.shared.requests.lock() {
            requests.push(request.clone());
        }
        self.shared.outputs.fetch_add(1, Ordering::AcqRel);
        Some(Arc::new(MemoryReaderOutput {
            shared: Arc::clone(&self.shared),
            kind: request.kind(),
            source,
            cursor: Mutex::new(Cursor::default()),
        }))
    }

    fn start_reading(&self) -> bool {
        if let Some(message) = &self.shared.script.fail_start_reading {
            self.shared.fail(message.clone());
            return false;
        }
        self.shared.started.store(true, Ordering::Release);
        self.shared.set_status(MediaStatus::InProgress);
        true
    }

    fn status(&self) -> MediaStatus {
        self.shared.status()
    }

    fn error(&self) -> Option<String> {
        self.shared.error.lock().ok().and_then(|error| error.clone())
    }

    fn cancel_reading(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.set_status(MediaStatus::Cancelled);
    }
}

enum OutputSource {
    Video {
        natural_size: Size,
        frame_size: Size,
        frame_rate: f64,
        composition: Option<VideoComposition>,
        pixel_format: PixelFormat,
    },
    Audio {
        volumes: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    },
}

#[derive(Default)]
struct Cursor {
    produced: u64,
    done: bool,
}

struct MemoryReaderOutput {
    shared: Arc<ReaderShared>,
    kind: TrackKind,
    source: OutputSource,
    cursor: Mutex<Cursor>,
}

impl MemoryReaderOutput {
    fn step(&self) -> TimeSpec {
        match &self.source {
            OutputSource::Video { frame_rate, .. } => TimeSpec::from_seconds(1.0 / frame_rate),
            OutputSource::Audio { sample_rate, .. } => TimeSpec::from_seconds(
                self.shared.script.audio_chunk_frames as f64 / (*sample_rate).max(1) as f64,
            ),
        }
    }

    fn limit_reached(&self, limit: Option<(TrackKind, u64)>, produced: u64) -> bool {
        matches!(limit, Some((kind, count)) if kind == self.kind && produced >= count)
    }

    fn make_sample(&self, index: u64, time: TimeSpec, step: TimeSpec) -> Result<SampleBuffer, String> {
        match &self.source {
            OutputSource::Video {
                natural_size,
                frame_size,
                composition,
                pixel_format,
                ..
            } => {
                let shade = (index % 251) as u8;
                let image = match (composition, pixel_format) {
                    (Some(composition), PixelFormat::Bgra) => {
                        let len = PixelFormat::Bgra.frame_len(natural_size.width, natural_size.height);
                        let source = PixelBuffer::from_data(
                            natural_size.width,
                            natural_size.height,
                            PixelFormat::Bgra,
                            vec![shade; len],
                        );
                        composition
                            .render_frame(&source, time)
                            .map_err(|err| err.to_string())?
                    }
                    (_, format) => {
                        let len = format.frame_len(frame_size.width, frame_size.height);
                        PixelBuffer::from_data(frame_size.width, frame_size.height, *format, vec![shade; len])
                    }
                };
                Ok(SampleBuffer::image(time, step, image))
            }
            OutputSource::Audio {
                volumes,
                sample_rate,
                channels,
            } => {
                let frames = self.shared.script.audio_chunk_frames;
                let mut mixed = AudioBuffer::silence(*sample_rate, *channels, frames);
                for volume in volumes {
                    let mut track = AudioBuffer {
                        sample_rate: *sample_rate,
                        channels: *channels,
                        samples: vec![SYNTHETIC_LEVEL; frames * *channels as usize],
                    };
                    track.apply_volume(*volume);
                    mixed.mix_in(&track);
                }
                Ok(SampleBuffer::audio(time, mixed))
            }
        }
    }
}

impl ReaderOutput for MemoryReaderOutput {
    fn copy_next_sample(&self) -> Option<SampleBuffer> {
        let shared = &self.shared;
        if !shared.started.load(Ordering::Acquire)
            || shared.cancelled.load(Ordering::Acquire)
            || shared.status() == MediaStatus::Failed
        {
            return None;
        }
        let mut cursor = match self.cursor.lock() {
            Ok(cursor) => cursor,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cursor.done {
            return None;
        }
        if let Some(delay) = shared.script.sample_delay {
            std::thread::sleep(delay);
        }

        if self.limit_reached(shared.script.read_failure_after, cursor.produced) {
            cursor.done = true;
            shared.fail(format!("synthetic {} read failure", self.kind));
            return None;
        }
        if self.limit_reached(shared.script.stall_after, cursor.produced) {
            cursor.done = true;
            return None;
        }

        let step = self.step();
        let time = TimeSpec::from_seconds(shared.start.seconds + cursor.produced as f64 * step.seconds);
        if time >= shared.end {
            cursor.done = true;
            shared.output_exhausted();
            return None;
        }

        match self.make_sample(cursor.produced, time, step) {
            Ok(sample) => {
                cursor.produced += 1;
                Some(sample)
            }
            Err(message) => {
                cursor.done = true;
                shared.fail(message);
                None
            }
        }
    }
}
