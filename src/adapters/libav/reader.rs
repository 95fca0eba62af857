use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use ffmpeg_next as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::software::{resampling, scaling};
use ffmpeg::util::frame;
use ffmpeg::{codec, ChannelLayout, Rational};
use tracing::{debug, warn};

use crate::domain::composition::{composition_frame_rate, VideoComposition};
use crate::domain::media::{AudioBuffer, PixelFormat, SampleBuffer};
use crate::domain::model::{AssetInfo, MediaStatus, TimeRange, TimeSpec};
use crate::domain::settings::AudioOutputSettings;
use crate::error::{ExportError, ExportResult};
use crate::ports::{MediaReader, OutputRequest, ReaderOutput};

use super::{av_pixel, frame_to_buffer, read_error};

/// Decoded samples buffered ahead of the consumer per output
const OUTPUT_QUEUE_DEPTH: usize = 4;

/// PCM frames per audio sample handed downstream
const AUDIO_CHUNK_FRAMES: usize = 1024;

pub struct LibavReader {
    shared: Arc<ReaderShared>,
    pending: Mutex<Vec<PendingOutput>>,
}

struct PendingOutput {
    plan: DecodePlan,
    sender: SyncSender<SampleBuffer>,
}

enum DecodePlan {
    Video {
        stream_index: usize,
        frame_rate: f64,
        composition: Option<VideoComposition>,
        pixel_format: PixelFormat,
    },
    Audio {
        lanes: Vec<(usize, f32)>,
        settings: AudioOutputSettings,
    },
}

struct ReaderShared {
    path: PathBuf,
    start: TimeSpec,
    end: TimeSpec,
    thread_count: usize,
    started: AtomicBool,
    cancelled: AtomicBool,
    outputs: AtomicUsize,
    finished: AtomicUsize,
    status: Mutex<MediaStatus>,
    error: Mutex<Option<String>>,
}

impl ReaderShared {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn status(&self) -> MediaStatus {
        self.status.lock().map(|s| *s).unwrap_or(MediaStatus::Failed)
    }

    fn set_status(&self, status: MediaStatus) {
        if let Ok(mut current) = self.status.lock() {
            if matches!(*current, MediaStatus::Unknown | MediaStatus::InProgress) {
                *current = status;
            }
        }
    }

    fn fail(&self, message: String) {
        warn!(path = %self.path.display(), error = %message, "decode failed");
        if let Ok(mut error) = self.error.lock() {
            error.get_or_insert(message);
        }
        self.set_status(MediaStatus::Failed);
    }

    fn output_finished(&self) {
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if finished >= self.outputs.load(Ordering::Acquire) {
            self.set_status(MediaStatus::Completed);
        }
    }

    fn seek_to_start(&self, ictx: &mut ffmpeg::format::context::Input) -> ExportResult<()> {
        if self.start.seconds > 0.0 {
            let ts = (self.start.seconds * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
            ictx.seek(ts, ..ts).map_err(read_error)?;
        }
        Ok(())
    }
}

impl LibavReader {
    pub(super) fn new(
        path: PathBuf,
        asset: AssetInfo,
        time_range: TimeRange,
        thread_count: usize,
    ) -> Self {
        let start = time_range.start;
        let end = start + time_range.resolved_duration(asset.duration);
        Self {
            shared: Arc::new(ReaderShared {
                path,
                start,
                end,
                thread_count,
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                outputs: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                status: Mutex::new(MediaStatus::Unknown),
                error: Mutex::new(None),
            }),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn plan_for(request: OutputRequest) -> Option<DecodePlan> {
        match request {
            OutputRequest::VideoTrack { track, settings } => Some(DecodePlan::Video {
                stream_index: track.track_id as usize,
                frame_rate: composition_frame_rate(None, track.nominal_frame_rate),
                composition: None,
                pixel_format: settings.pixel_format,
            }),
            OutputRequest::VideoComposition {
                tracks,
                composition,
                ..
            } => {
                let track = tracks.first()?;
                Some(DecodePlan::Video {
                    stream_index: track.track_id as usize,
                    frame_rate: composition.frame_rate,
                    composition: Some(composition),
                    // rendering works on packed pixels
                    pixel_format: PixelFormat::Bgra,
                })
            }
            OutputRequest::AudioTrack { track, settings } => Some(DecodePlan::Audio {
                lanes: vec![(track.track_id as usize, 1.0)],
                settings,
            }),
            OutputRequest::AudioMix {
                tracks,
                mix,
                settings,
            } => {
                if tracks.is_empty() {
                    return None;
                }
                Some(DecodePlan::Audio {
                    lanes: tracks
                        .iter()
                        .map(|t| (t.track_id as usize, mix.volume_for(t.track_id)))
                        .collect(),
                    settings,
                })
            }
        }
    }
}

impl MediaReader for LibavReader {
    fn add_output(&self, request: OutputRequest) -> Option<Arc<dyn ReaderOutput>> {
        if self.shared.started.load(Ordering::Acquire) {
            return None;
        }
        let plan = Self::plan_for(request)?;
        let (sender, receiver) = sync_channel(OUTPUT_QUEUE_DEPTH);
        self.pending.lock().ok()?.push(PendingOutput { plan, sender });
        self.shared.outputs.fetch_add(1, Ordering::AcqRel);
        Some(Arc::new(LibavReaderOutput {
            receiver: Mutex::new(receiver),
        }))
    }

    fn start_reading(&self) -> bool {
        let pending = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return false,
        };
        self.shared.started.store(true, Ordering::Release);
        self.shared.set_status(MediaStatus::InProgress);

        for (index, output) in pending.into_iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("reframe-decode-{}", index))
                .spawn(move || {
                    let result = match output.plan {
                        DecodePlan::Video {
                            stream_index,
                            frame_rate,
                            composition,
                            pixel_format,
                        } => decode_video(
                            &shared,
                            stream_index,
                            frame_rate,
                            composition.as_ref(),
                            pixel_format,
                            &output.sender,
                        ),
                        DecodePlan::Audio { lanes, settings } => {
                            decode_audio(&shared, &lanes, settings, &output.sender)
                        }
                    };
                    match result {
                        Ok(()) if !shared.is_cancelled() => shared.output_finished(),
                        Ok(()) => {}
                        Err(err) => shared.fail(err.to_string()),
                    }
                });
            if let Err(err) = spawned {
                self.shared.fail(format!("failed to start decoder thread: {}", err));
                return false;
            }
        }
        true
    }

    fn status(&self) -> MediaStatus {
        self.shared.status()
    }

    fn error(&self) -> Option<String> {
        self.shared.error.lock().ok().and_then(|e| e.clone())
    }

    fn cancel_reading(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.set_status(MediaStatus::Cancelled);
        // outputs never started hold their senders here
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

struct LibavReaderOutput {
    receiver: Mutex<Receiver<SampleBuffer>>,
}

impl ReaderOutput for LibavReaderOutput {
    fn copy_next_sample(&self) -> Option<SampleBuffer> {
        self.receiver.lock().ok()?.recv().ok()
    }
}

fn open_decoder_context(
    shared: &ReaderShared,
    parameters: codec::Parameters,
) -> ExportResult<codec::context::Context> {
    let mut context = codec::context::Context::from_parameters(parameters).map_err(read_error)?;
    context.set_threading(codec::threading::Config::count(shared.thread_count));
    Ok(context)
}

fn seconds(ts: i64, time_base: Rational) -> TimeSpec {
    TimeSpec::from_seconds(ts as f64 * f64::from(time_base))
}

/// Decode one video stream, converting each frame in range to `pixel_format`
fn decode_video(
    shared: &ReaderShared,
    stream_index: usize,
    frame_rate: f64,
    composition: Option<&VideoComposition>,
    pixel_format: PixelFormat,
    sender: &SyncSender<SampleBuffer>,
) -> ExportResult<()> {
    let mut ictx = ffmpeg::format::input(&shared.path).map_err(read_error)?;
    let (parameters, time_base) = {
        let stream = ictx
            .stream(stream_index)
            .ok_or_else(|| ExportError::read(format!("video stream {} not found", stream_index)))?;
        (stream.parameters(), stream.time_base())
    };
    let mut decoder = open_decoder_context(shared, parameters)?
        .decoder()
        .video()
        .map_err(read_error)?;
    shared.seek_to_start(&mut ictx)?;

    let mut scaler = scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        av_pixel(pixel_format),
        decoder.width(),
        decoder.height(),
        scaling::Flags::BILINEAR,
    )
    .map_err(read_error)?;
    let frame_duration = TimeSpec::from_seconds(1.0 / frame_rate);

    let mut decoded = frame::Video::empty();
    let mut converted = frame::Video::empty();
    let mut produced = 0u64;

    // returns false once the range end is passed or the consumer went away
    let mut receive = |decoder: &mut ffmpeg::decoder::Video| -> ExportResult<bool> {
        while decoder.receive_frame(&mut decoded).is_ok() {
            let Some(ts) = decoded.timestamp().or(decoded.pts()) else {
                continue;
            };
            let time = seconds(ts, time_base);
            if time < shared.start {
                continue;
            }
            if time >= shared.end {
                return Ok(false);
            }
            scaler.run(&decoded, &mut converted).map_err(read_error)?;
            let mut image = frame_to_buffer(&converted, pixel_format);
            if let Some(composition) = composition {
                image = composition.render_frame(&image, time)?;
            }
            if sender
                .send(SampleBuffer::image(time, frame_duration, image))
                .is_err()
            {
                return Ok(false);
            }
            produced += 1;
        }
        Ok(true)
    };

    let mut more = true;
    for (stream, packet) in ictx.packets() {
        if shared.is_cancelled() {
            return Ok(());
        }
        if stream.index() != stream_index {
            continue;
        }
        decoder.send_packet(&packet).map_err(read_error)?;
        more = receive(&mut decoder)?;
        if !more {
            break;
        }
    }
    if more && !shared.is_cancelled() {
        decoder.send_eof().map_err(read_error)?;
        receive(&mut decoder)?;
    }
    debug!(stream_index, frames = produced, "video decode finished");
    Ok(())
}

/// One audio stream feeding a (possibly mixed) output
struct AudioLane {
    stream_index: usize,
    volume: f32,
    time_base: Rational,
    decoder: ffmpeg::decoder::Audio,
    resampler: resampling::Context,
    queue: VecDeque<i16>,
    ended: bool,
}

impl AudioLane {
    fn receive(&mut self, shared: &ReaderShared, channels: usize) -> ExportResult<()> {
        let mut decoded = frame::Audio::empty();
        let mut resampled = frame::Audio::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if let Some(ts) = decoded.timestamp().or(decoded.pts()) {
                let time = seconds(ts, self.time_base);
                if time < shared.start {
                    continue;
                }
                if time >= shared.end {
                    self.ended = true;
                    return Ok(());
                }
            }
            self.resampler
                .run(&decoded, &mut resampled)
                .map_err(read_error)?;
            let values = resampled.samples() * channels;
            let bytes = &resampled.data(0)[..values * 2];
            self.queue.extend(
                bytes
                    .chunks_exact(2)
                    .map(|pair| i16::from_ne_bytes([pair[0], pair[1]])),
            );
        }
        Ok(())
    }
}

/// Decode the listed audio streams to interleaved 16-bit PCM, mixing them down
fn decode_audio(
    shared: &ReaderShared,
    lanes: &[(usize, f32)],
    settings: AudioOutputSettings,
    sender: &SyncSender<SampleBuffer>,
) -> ExportResult<()> {
    let mut ictx = ffmpeg::format::input(&shared.path).map_err(read_error)?;
    let channels = settings.channels.max(1) as usize;
    let out_layout = ChannelLayout::default(channels as i32);
    let out_format = Sample::I16(SampleType::Packed);

    let mut audio_lanes = Vec::with_capacity(lanes.len());
    for (stream_index, volume) in lanes {
        let (parameters, time_base) = {
            let stream = ictx.stream(*stream_index).ok_or_else(|| {
                ExportError::read(format!("audio stream {} not found", stream_index))
            })?;
            (stream.parameters(), stream.time_base())
        };
        let decoder = open_decoder_context(shared, parameters)?
            .decoder()
            .audio()
            .map_err(read_error)?;
        let resampler = resampling::Context::get2(
            decoder.format(),
            decoder.ch_layout(),
            decoder.rate(),
            out_format,
            out_layout.clone(),
            settings.sample_rate,
        )
        .map_err(read_error)?;
        audio_lanes.push(AudioLane {
            stream_index: *stream_index,
            volume: *volume,
            time_base,
            decoder,
            resampler,
            queue: VecDeque::new(),
            ended: false,
        });
    }
    shared.seek_to_start(&mut ictx)?;

    let mut mixer = ChunkMixer {
        sample_rate: settings.sample_rate,
        channels: channels as u16,
        emitted_frames: 0,
        start: shared.start,
    };

    for (stream, packet) in ictx.packets() {
        if shared.is_cancelled() {
            return Ok(());
        }
        let Some(lane) = audio_lanes
            .iter_mut()
            .find(|lane| lane.stream_index == stream.index() && !lane.ended)
        else {
            continue;
        };
        lane.decoder.send_packet(&packet).map_err(read_error)?;
        lane.receive(shared, channels)?;

        if !mixer.emit_ready(&mut audio_lanes, sender, false) {
            return Ok(());
        }
        if audio_lanes.iter().all(|lane| lane.ended) {
            break;
        }
    }

    if shared.is_cancelled() {
        return Ok(());
    }
    for lane in audio_lanes.iter_mut().filter(|lane| !lane.ended) {
        lane.decoder.send_eof().map_err(read_error)?;
        lane.receive(shared, channels)?;
        lane.ended = true;
    }
    mixer.emit_ready(&mut audio_lanes, sender, true);
    debug!(lanes = lanes.len(), "audio decode finished");
    Ok(())
}

struct ChunkMixer {
    sample_rate: u32,
    channels: u16,
    emitted_frames: u64,
    start: TimeSpec,
}

impl ChunkMixer {
    /// Emit every full chunk all live lanes can fill; with `flush` also the
    /// remainder. Returns false when the consumer went away.
    fn emit_ready(
        &mut self,
        lanes: &mut [AudioLane],
        sender: &SyncSender<SampleBuffer>,
        flush: bool,
    ) -> bool {
        let chunk_len = AUDIO_CHUNK_FRAMES * self.channels as usize;
        loop {
            let available = lanes
                .iter()
                .filter(|lane| !lane.ended || !lane.queue.is_empty())
                .map(|lane| lane.queue.len())
                .min()
                .unwrap_or(0);
            let take = if available >= chunk_len {
                chunk_len
            } else if flush {
                lanes.iter().map(|lane| lane.queue.len()).max().unwrap_or(0).min(chunk_len)
            } else {
                return true;
            };
            if take == 0 {
                return true;
            }
            // keep whole frames only
            let take = take - take % self.channels as usize;
            if take == 0 {
                return true;
            }

            let frames = take / self.channels as usize;
            let mut mixed = AudioBuffer::silence(self.sample_rate, self.channels, frames);
            for lane in lanes.iter_mut() {
                let count = take.min(lane.queue.len());
                let mut part = AudioBuffer {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    samples: lane.queue.drain(..count).collect(),
                };
                part.apply_volume(lane.volume);
                mixed.mix_in(&part);
            }
            let time = TimeSpec::from_seconds(
                self.start.seconds + self.emitted_frames as f64 / self.sample_rate.max(1) as f64,
            );
            self.emitted_frames += frames as u64;
            if sender.send(SampleBuffer::audio(time, mixed)).is_err() {
                return false;
            }
        }
    }
}
