use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::util::frame;
use ffmpeg::{codec, encoder, ChannelLayout, Dictionary, Packet, Rational};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::domain::media::{AudioBuffer, PixelBuffer, PixelFormat, SampleBuffer, SamplePayload};
use crate::domain::model::{ContainerKind, MediaStatus, TimeSpec, TrackKind};
use crate::domain::settings::{AudioSettings, VideoCodec, VideoSettings};
use crate::error::{ExportError, ExportResult};
use crate::ports::{InputRequest, MediaWriter, WriterInput, WriterOptions};

use super::{av_pixel, buffer_to_frame, write_error};

/// Samples an input may queue ahead of the encoder thread before it reports not ready
const MAX_PENDING_SAMPLES: usize = 8;

/// Encoder time base for video frames
const VIDEO_TIME_BASE: i32 = 90_000;

enum Command {
    Video {
        input: usize,
        buffer: PixelBuffer,
        time: TimeSpec,
    },
    Audio {
        input: usize,
        buffer: AudioBuffer,
    },
    Finish(oneshot::Sender<ExportResult<()>>),
    Cancel,
}

struct WriterShared {
    status: Mutex<MediaStatus>,
    error: Mutex<Option<String>>,
    /// Woken whenever the encoder thread drains a command or the status changes
    progress: Notify,
}

impl WriterShared {
    fn status(&self) -> MediaStatus {
        self.status.lock().map(|s| *s).unwrap_or(MediaStatus::Failed)
    }

    fn transition(&self, from: &[MediaStatus], to: MediaStatus) -> bool {
        let moved = match self.status.lock() {
            Ok(mut status) if from.contains(&*status) => {
                *status = to;
                true
            }
            _ => false,
        };
        if moved {
            self.progress.notify_waiters();
        }
        moved
    }

    fn fail(&self, message: String) {
        warn!(error = %message, "encode failed");
        if let Ok(mut error) = self.error.lock() {
            error.get_or_insert(message);
        }
        self.transition(
            &[MediaStatus::Unknown, MediaStatus::InProgress],
            MediaStatus::Failed,
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Encodes H.264/HEVC video and AAC audio and muxes them with libav
pub struct LibavWriter {
    path: PathBuf,
    container: ContainerKind,
    options: WriterOptions,
    thread_count: usize,
    shared: Arc<WriterShared>,
    commands: Sender<Command>,
    receiver: Mutex<Option<Receiver<Command>>>,
    inputs: Mutex<Vec<Arc<LibavInput>>>,
}

impl LibavWriter {
    pub(super) fn new(
        path: PathBuf,
        container: ContainerKind,
        options: WriterOptions,
        thread_count: usize,
    ) -> Self {
        let (commands, receiver) = channel();
        Self {
            path,
            container,
            options,
            thread_count,
            shared: Arc::new(WriterShared {
                status: Mutex::new(MediaStatus::Unknown),
                error: Mutex::new(None),
                progress: Notify::new(),
            }),
            commands,
            receiver: Mutex::new(Some(receiver)),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaWriter for LibavWriter {
    fn add_input(&self, request: InputRequest) -> Option<Arc<dyn WriterInput>> {
        if self.shared.status() != MediaStatus::Unknown {
            return None;
        }
        let mut inputs = lock(&self.inputs);
        let input = Arc::new(LibavInput {
            index: inputs.len(),
            request,
            shared: Arc::clone(&self.shared),
            commands: self.commands.clone(),
            pending: Arc::new(AtomicUsize::new(0)),
            finished: AtomicBool::new(false),
        });
        inputs.push(Arc::clone(&input));
        Some(input)
    }

    fn start_writing(&self) -> bool {
        let Some(receiver) = lock(&self.receiver).take() else {
            return false;
        };
        let plan = MuxerPlan {
            path: self.path.clone(),
            container: self.container,
            options: self.options.clone(),
            thread_count: self.thread_count,
            inputs: lock(&self.inputs)
                .iter()
                .map(|input| (input.request.clone(), Arc::clone(&input.pending)))
                .collect(),
        };
        let shared = Arc::clone(&self.shared);
        let (setup_tx, setup_rx) = std::sync::mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("reframe-encode".to_string())
            .spawn(move || run_encoder(plan, receiver, shared, setup_tx));
        if let Err(err) = spawned {
            self.shared
                .fail(format!("failed to start encoder thread: {}", err));
            return false;
        }

        match setup_rx.recv() {
            Ok(Ok(())) => self
                .shared
                .transition(&[MediaStatus::Unknown], MediaStatus::InProgress),
            Ok(Err(err)) => {
                self.shared.fail(err.to_string());
                false
            }
            Err(_) => {
                self.shared.fail("encoder thread exited during setup".to_string());
                false
            }
        }
    }

    fn start_session(&self, at: TimeSpec) {
        debug!(at = %at, "writer session started");
    }

    async fn finish_writing(&self) -> ExportResult<()> {
        let status = self.shared.status();
        if status != MediaStatus::InProgress {
            return Err(ExportError::finalize(format!(
                "writer is {:?}, not writing",
                status
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Finish(reply_tx))
            .map_err(|_| ExportError::finalize("encoder thread is gone"))?;
        let result = reply_rx
            .await
            .map_err(|_| ExportError::finalize("encoder thread exited before finishing"))?;
        match result {
            Ok(()) => {
                self.shared
                    .transition(&[MediaStatus::InProgress], MediaStatus::Completed);
                info!(path = %self.path.display(), "output finalized");
                Ok(())
            }
            Err(err) => {
                self.shared.fail(err.to_string());
                Err(match err {
                    ExportError::Finalize { .. } => err,
                    other => ExportError::finalize(other.to_string()),
                })
            }
        }
    }

    fn cancel_writing(&self) {
        if self.shared.transition(
            &[MediaStatus::Unknown, MediaStatus::InProgress],
            MediaStatus::Cancelled,
        ) {
            let _ = self.commands.send(Command::Cancel);
        }
    }

    fn status(&self) -> MediaStatus {
        self.shared.status()
    }

    fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }
}

struct LibavInput {
    index: usize,
    request: InputRequest,
    shared: Arc<WriterShared>,
    commands: Sender<Command>,
    pending: Arc<AtomicUsize>,
    finished: AtomicBool,
}

impl LibavInput {
    fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.shared.status() != MediaStatus::InProgress
    }

    fn enqueue(&self, command: Command) -> bool {
        if self.is_closed() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

#[async_trait]
impl WriterInput for LibavInput {
    async fn ready_for_more_media_data(&self) {
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() || self.is_ready_for_more_media_data() {
                return;
            }
            notified.await;
        }
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        !self.is_closed() && self.pending.load(Ordering::Acquire) < MAX_PENDING_SAMPLES
    }

    fn append_sample(&self, sample: SampleBuffer) -> bool {
        let time = sample.presentation_time;
        match (self.request.kind(), sample.payload) {
            (TrackKind::Video, SamplePayload::Image(buffer)) => self.enqueue(Command::Video {
                input: self.index,
                buffer,
                time,
            }),
            (TrackKind::Audio, SamplePayload::Audio(buffer)) => self.enqueue(Command::Audio {
                input: self.index,
                buffer,
            }),
            _ => false,
        }
    }

    fn append_pixel_buffer(&self, buffer: PixelBuffer, presentation_time: TimeSpec) -> bool {
        if self.request.kind() != TrackKind::Video {
            return false;
        }
        self.enqueue(Command::Video {
            input: self.index,
            buffer,
            time: presentation_time,
        })
    }

    fn mark_as_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

struct MuxerPlan {
    path: PathBuf,
    container: ContainerKind,
    options: WriterOptions,
    thread_count: usize,
    inputs: Vec<(InputRequest, Arc<AtomicUsize>)>,
}

struct VideoTrack {
    stream_index: usize,
    encoder: encoder::Video,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    scaler: Option<(PixelFormat, u32, u32, scaling::Context)>,
    last_pts: Option<i64>,
}

struct AudioTrack {
    stream_index: usize,
    encoder: encoder::Audio,
    stream_time_base: Rational,
    sample_rate: u32,
    channels: usize,
    layout: ChannelLayout,
    frame_size: usize,
    resampler: Option<(u32, u16, resampling::Context)>,
    planes: Vec<Vec<f32>>,
    next_pts: i64,
}

enum EncoderTrack {
    Video(VideoTrack),
    Audio(AudioTrack),
}

struct Muxer {
    octx: ffmpeg::format::context::Output,
    tracks: Vec<EncoderTrack>,
    pending: Vec<Arc<AtomicUsize>>,
}

fn run_encoder(
    plan: MuxerPlan,
    commands: Receiver<Command>,
    shared: Arc<WriterShared>,
    setup: Sender<ExportResult<()>>,
) {
    let mut muxer = match Muxer::open(&plan) {
        Ok(muxer) => {
            let _ = setup.send(Ok(()));
            muxer
        }
        Err(err) => {
            let _ = setup.send(Err(err));
            return;
        }
    };

    let mut failed = false;
    while let Ok(command) = commands.recv() {
        match command {
            Command::Video { input, buffer, time } => {
                muxer.dequeued(input);
                if !failed {
                    if let Err(err) = muxer.encode_video(input, &buffer, time) {
                        failed = true;
                        shared.fail(err.to_string());
                    }
                }
            }
            Command::Audio { input, buffer } => {
                muxer.dequeued(input);
                if !failed {
                    if let Err(err) = muxer.encode_audio(input, &buffer) {
                        failed = true;
                        shared.fail(err.to_string());
                    }
                }
            }
            Command::Finish(reply) => {
                let result = if failed {
                    Err(ExportError::finalize("encoding failed before finalize"))
                } else {
                    muxer.finish()
                };
                let _ = reply.send(result);
                return;
            }
            Command::Cancel => {
                debug!(path = %plan.path.display(), "encoder cancelled");
                return;
            }
        }
        shared.progress.notify_waiters();
    }
}

fn video_codec(codec: VideoCodec) -> Option<ffmpeg::Codec> {
    let id = match codec {
        VideoCodec::H264 => codec::Id::H264,
        VideoCodec::Hevc => codec::Id::HEVC,
    };
    encoder::find_by_name(codec.encoder_name()).or_else(|| encoder::find(id))
}

impl Muxer {
    fn open(plan: &MuxerPlan) -> ExportResult<Self> {
        let mut octx = ffmpeg::format::output_as(&plan.path, plan.container.muxer_name())
            .map_err(|e| ExportError::open(plan.path.display().to_string(), e.to_string()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut tracks = Vec::with_capacity(plan.inputs.len());
        for (request, _) in &plan.inputs {
            let track = match request {
                InputRequest::Video { settings, .. } => EncoderTrack::Video(Self::add_video(
                    &mut octx,
                    settings,
                    global_header,
                    plan.thread_count,
                )?),
                InputRequest::Audio { settings } => {
                    EncoderTrack::Audio(Self::add_audio(&mut octx, settings, global_header)?)
                }
            };
            tracks.push(track);
        }

        let mut metadata = Dictionary::new();
        for item in &plan.options.metadata {
            metadata.set(&item.key, &item.value);
        }
        octx.set_metadata(metadata);

        if plan.options.network_optimized {
            let mut options = Dictionary::new();
            options.set("movflags", "faststart");
            octx.write_header_with(options).map_err(write_error)?;
        } else {
            octx.write_header().map_err(write_error)?;
        }

        // the muxer may pick its own stream time bases while writing the header
        for track in &mut tracks {
            let (index, time_base) = match track {
                EncoderTrack::Video(video) => (video.stream_index, &mut video.stream_time_base),
                EncoderTrack::Audio(audio) => (audio.stream_index, &mut audio.stream_time_base),
            };
            if let Some(stream) = octx.stream(index) {
                *time_base = stream.time_base();
            }
        }

        Ok(Self {
            octx,
            tracks,
            pending: plan.inputs.iter().map(|(_, p)| Arc::clone(p)).collect(),
        })
    }

    fn add_video(
        octx: &mut ffmpeg::format::context::Output,
        settings: &VideoSettings,
        global_header: bool,
        thread_count: usize,
    ) -> ExportResult<VideoTrack> {
        let codec = video_codec(settings.codec).ok_or_else(|| {
            ExportError::open("video encoder", format!("{} is unavailable", settings.codec.encoder_name()))
        })?;
        let mut context = codec::context::Context::new_with_codec(codec);
        context.set_threading(codec::threading::Config::count(thread_count));
        let mut video = context.encoder().video().map_err(write_error)?;

        let frame_rate = settings
            .target_frame_rate()
            .unwrap_or(settings.compression.expected_source_frame_rate);
        video.set_width(settings.width);
        video.set_height(settings.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(Rational::new(1, VIDEO_TIME_BASE));
        video.set_frame_rate(Some(Rational::new((frame_rate * 1000.0).round() as i32, 1000)));
        video.set_bit_rate(settings.compression.average_bit_rate as usize);
        if !settings.compression.allow_frame_reordering {
            video.set_max_b_frames(0);
        }
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut options = Dictionary::new();
        options.set("profile", settings.compression.profile_level.x264_profile());
        let encoder = video.open_as_with(codec, options).map_err(write_error)?;

        let mut stream = octx.add_stream(codec).map_err(write_error)?;
        stream.set_parameters(&encoder);
        stream.set_time_base(Rational::new(1, VIDEO_TIME_BASE));
        Ok(VideoTrack {
            stream_index: stream.index(),
            encoder,
            stream_time_base: Rational::new(1, VIDEO_TIME_BASE),
            width: settings.width,
            height: settings.height,
            scaler: None,
            last_pts: None,
        })
    }

    fn add_audio(
        octx: &mut ffmpeg::format::context::Output,
        settings: &AudioSettings,
        global_header: bool,
    ) -> ExportResult<AudioTrack> {
        let codec = encoder::find(codec::Id::AAC)
            .ok_or_else(|| ExportError::open("audio encoder", "aac is unavailable"))?;
        let mut audio = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(write_error)?;
        let layout = ChannelLayout::default(settings.channels as i32);
        audio.set_rate(settings.sample_rate as i32);
        audio.set_ch_layout(layout.clone());
        audio.set_format(Sample::F32(SampleType::Planar));
        audio.set_bit_rate(settings.bit_rate as usize);
        audio.set_time_base(Rational::new(1, settings.sample_rate as i32));
        if global_header {
            audio.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let encoder = audio.open_as(codec).map_err(write_error)?;
        let frame_size = match encoder.frame_size() {
            0 => 1024,
            size => size as usize,
        };

        let mut stream = octx.add_stream(codec).map_err(write_error)?;
        stream.set_parameters(&encoder);
        stream.set_time_base(Rational::new(1, settings.sample_rate as i32));
        Ok(AudioTrack {
            stream_index: stream.index(),
            encoder,
            stream_time_base: Rational::new(1, settings.sample_rate as i32),
            sample_rate: settings.sample_rate,
            channels: settings.channels as usize,
            layout,
            frame_size,
            resampler: None,
            planes: vec![Vec::new(); settings.channels as usize],
            next_pts: 0,
        })
    }

    fn dequeued(&self, input: usize) {
        if let Some(pending) = self.pending.get(input) {
            pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn encode_video(&mut self, input: usize, buffer: &PixelBuffer, time: TimeSpec) -> ExportResult<()> {
        let Some(EncoderTrack::Video(track)) = self.tracks.get_mut(input) else {
            return Err(ExportError::write("sample routed to a non-video input"));
        };

        let mut source = frame::Video::new(av_pixel(buffer.format), buffer.width, buffer.height);
        buffer_to_frame(buffer, &mut source);

        let needs_scaler = !matches!(
            &track.scaler,
            Some((format, w, h, _)) if *format == buffer.format && *w == buffer.width && *h == buffer.height
        );
        if needs_scaler {
            let scaler = scaling::Context::get(
                av_pixel(buffer.format),
                buffer.width,
                buffer.height,
                Pixel::YUV420P,
                track.width,
                track.height,
                scaling::Flags::BILINEAR,
            )
            .map_err(write_error)?;
            track.scaler = Some((buffer.format, buffer.width, buffer.height, scaler));
        }
        let mut yuv = frame::Video::empty();
        if let Some((_, _, _, scaler)) = track.scaler.as_mut() {
            scaler.run(&source, &mut yuv).map_err(write_error)?;
        }

        let mut pts = (time.seconds * VIDEO_TIME_BASE as f64).round() as i64;
        if let Some(last) = track.last_pts {
            pts = pts.max(last + 1);
        }
        track.last_pts = Some(pts);
        yuv.set_pts(Some(pts));

        track.encoder.send_frame(&yuv).map_err(write_error)?;
        let (index, encoder_tb, stream_tb) = (
            track.stream_index,
            Rational::new(1, VIDEO_TIME_BASE),
            track.stream_time_base,
        );
        drain_packets(&mut track.encoder, &mut self.octx, index, encoder_tb, stream_tb)
    }

    fn encode_audio(&mut self, input: usize, buffer: &AudioBuffer) -> ExportResult<()> {
        let Some(EncoderTrack::Audio(track)) = self.tracks.get_mut(input) else {
            return Err(ExportError::write("sample routed to a non-audio input"));
        };
        if buffer.frames() == 0 {
            return Ok(());
        }

        let needs_resampler = !matches!(
            &track.resampler,
            Some((rate, channels, _)) if *rate == buffer.sample_rate && *channels == buffer.channels
        );
        if needs_resampler {
            let resampler = resampling::Context::get2(
                Sample::I16(SampleType::Packed),
                ChannelLayout::default(buffer.channels as i32),
                buffer.sample_rate,
                Sample::F32(SampleType::Planar),
                track.layout.clone(),
                track.sample_rate,
            )
            .map_err(write_error)?;
            track.resampler = Some((buffer.sample_rate, buffer.channels, resampler));
        }

        let mut source = frame::Audio::new(
            Sample::I16(SampleType::Packed),
            buffer.frames(),
            ChannelLayout::default(buffer.channels as i32),
        );
        source.set_rate(buffer.sample_rate);
        {
            let bytes = source.data_mut(0);
            for (index, sample) in buffer.samples.iter().enumerate() {
                bytes[index * 2..index * 2 + 2].copy_from_slice(&sample.to_ne_bytes());
            }
        }
        let mut planar = frame::Audio::empty();
        if let Some((_, _, resampler)) = track.resampler.as_mut() {
            resampler.run(&source, &mut planar).map_err(write_error)?;
        }
        let produced = planar.samples();
        for (channel, plane) in track.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&planar.plane::<f32>(channel)[..produced]);
        }

        while track.planes.first().map_or(0, Vec::len) >= track.frame_size {
            let size = track.frame_size;
            encode_audio_frame(track, &mut self.octx, size)?;
        }
        Ok(())
    }

    fn finish(mut self) -> ExportResult<()> {
        for track in &mut self.tracks {
            match track {
                EncoderTrack::Video(video) => {
                    video.encoder.send_eof().map_err(finalize_error)?;
                    drain_packets(
                        &mut video.encoder,
                        &mut self.octx,
                        video.stream_index,
                        Rational::new(1, VIDEO_TIME_BASE),
                        video.stream_time_base,
                    )?;
                }
                EncoderTrack::Audio(audio) => {
                    let remainder = audio.planes.first().map_or(0, Vec::len);
                    if remainder > 0 {
                        encode_audio_frame(audio, &mut self.octx, remainder)?;
                    }
                    audio.encoder.send_eof().map_err(finalize_error)?;
                    let encoder_tb = Rational::new(1, audio.sample_rate as i32);
                    drain_packets(
                        &mut audio.encoder,
                        &mut self.octx,
                        audio.stream_index,
                        encoder_tb,
                        audio.stream_time_base,
                    )?;
                }
            }
        }
        self.octx.write_trailer().map_err(finalize_error)?;
        Ok(())
    }
}

fn encode_audio_frame(
    track: &mut AudioTrack,
    octx: &mut ffmpeg::format::context::Output,
    size: usize,
) -> ExportResult<()> {
    let mut frame = frame::Audio::new(Sample::F32(SampleType::Planar), size, track.layout.clone());
    frame.set_rate(track.sample_rate);
    for channel in 0..track.channels {
        let samples: Vec<f32> = track.planes[channel].drain(..size).collect();
        frame.plane_mut::<f32>(channel)[..size].copy_from_slice(&samples);
    }
    frame.set_pts(Some(track.next_pts));
    track.next_pts += size as i64;

    track.encoder.send_frame(&frame).map_err(write_error)?;
    let encoder_tb = Rational::new(1, track.sample_rate as i32);
    drain_packets(
        &mut track.encoder,
        octx,
        track.stream_index,
        encoder_tb,
        track.stream_time_base,
    )
}

fn drain_packets(
    encoder: &mut codec::encoder::Encoder,
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
) -> ExportResult<()> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(octx).map_err(write_error)?;
    }
    Ok(())
}

fn finalize_error(err: ffmpeg::Error) -> ExportError {
    ExportError::finalize(err.to_string())
}
