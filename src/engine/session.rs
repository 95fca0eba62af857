//! Export orchestrator: owns one job's reader, writer and track pipelines and
//! drives them through `idle → reading_and_writing → completed | failed | cancelled`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::fs_local::LocalFsAdapter;
use crate::domain::composition::build_default_composition;
use crate::domain::model::{ExportJob, ExportStatus, MediaStatus, Size, TimeSpec, TrackKind};
use crate::domain::orientation::rotation_of;
use crate::domain::rules::{SizeEstimator, VideoSettingsDeriver};
use crate::domain::settings::{
    AudioOutputSettings, AudioSettings, PixelBufferAttributes, VideoOutputSettings, VideoSettings,
};
use crate::engine::completion::CompletionGroup;
use crate::engine::pool::{FramePool, DEFAULT_POOL_CAPACITY};
use crate::engine::progress::{ProgressCallback, ProgressCell};
use crate::engine::track::{lock_pipeline, run_pipeline, SharedPipeline, TrackContext, TrackPipeline};
use crate::engine::{ErrorSlot, ProgressEvent};
use crate::error::{ExportError, ExportResult};
use crate::ports::{
    FrameProcessor, FsPort, InputRequest, MediaBackend, MediaReader, MediaWriter, OutputRequest,
    PixelBufferPool, WriterOptions,
};

/// Outcome handed to the completion callback
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub status: ExportStatus,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ExportError>,
    pub output_path: Option<PathBuf>,
    pub progress: f64,
    /// Media duration the job covers
    pub duration: TimeSpec,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.status == ExportStatus::Completed
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<ExportError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

mod duration_millis {
    pub fn serialize<S: serde::Serializer>(
        duration: &std::time::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Handles that live only while one run is in flight
#[derive(Clone)]
struct RunHandles {
    cancelled: Arc<AtomicBool>,
    cancel_tx: Arc<watch::Sender<bool>>,
    errors: Arc<ErrorSlot>,
    reader: Arc<dyn MediaReader>,
    writer: Arc<dyn MediaWriter>,
    video: Option<SharedPipeline>,
    audio: Option<SharedPipeline>,
}

struct SessionState {
    status: ExportStatus,
    /// Set while `start` opens the reader and writer
    starting: bool,
    /// `cancel` arrived while `starting`
    cancel_pending: bool,
    job: Option<ExportJob>,
    last_error: Option<ExportError>,
    run: Option<RunHandles>,
}

struct SessionInner {
    backend: Arc<dyn MediaBackend>,
    fs: Arc<dyn FsPort>,
    state: Mutex<SessionState>,
    progress: Arc<ProgressCell>,
    observer: Mutex<Option<Arc<dyn ProgressCallback>>>,
    processor: Mutex<Option<Arc<dyn FrameProcessor>>>,
}

/// Everything `start` set up before the pipelines are spawned
struct PreparedRun {
    handles: RunHandles,
    group: Arc<CompletionGroup>,
    completion_rx: oneshot::Receiver<()>,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    contexts: Vec<(SharedPipeline, Arc<TrackContext>)>,
    output_path: PathBuf,
    total_duration: TimeSpec,
    started_at: Instant,
}

/// Cancelable, progress-reporting export of one asset.
///
/// Cloning yields another handle to the same session, so a clone can call
/// [`ExportSession::cancel`] from any task or thread while the export runs.
#[derive(Clone)]
pub struct ExportSession {
    inner: Arc<SessionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ExportSession {
    pub fn new(backend: Arc<dyn MediaBackend>, fs: Arc<dyn FsPort>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                fs,
                state: Mutex::new(SessionState {
                    status: ExportStatus::Idle,
                    starting: false,
                    cancel_pending: false,
                    job: None,
                    last_error: None,
                    run: None,
                }),
                progress: Arc::new(ProgressCell::new()),
                observer: Mutex::new(None),
                processor: Mutex::new(None),
            }),
        }
    }

    /// Session writing through the local filesystem
    pub fn with_backend(backend: Arc<dyn MediaBackend>) -> Self {
        Self::new(backend, Arc::new(LocalFsAdapter::new()))
    }

    /// Set the job for the next run, clearing progress, status and error.
    pub fn configure(&self, job: ExportJob) -> ExportResult<()> {
        let mut state = lock(&self.inner.state);
        if state.status == ExportStatus::ReadingAndWriting || state.starting {
            return Err(ExportError::invalid_state(
                "cannot reconfigure while an export is running",
            ));
        }
        job.validate()?;
        debug!(source = %job.asset.source, preset = %job.preset, "export job configured");
        state.job = Some(job);
        state.status = ExportStatus::Idle;
        state.last_error = None;
        state.run = None;
        self.inner.progress.set(0.0);
        Ok(())
    }

    /// Observer notified on the driving task for every progress advance
    pub fn set_progress_callback(&self, callback: Arc<dyn ProgressCallback>) {
        *lock(&self.inner.observer) = Some(callback);
    }

    /// Per-frame hook applied to every video frame
    pub fn set_frame_processor(&self, processor: Arc<dyn FrameProcessor>) {
        *lock(&self.inner.processor) = Some(processor);
    }

    pub fn job(&self) -> Option<ExportJob> {
        lock(&self.inner.state).job.clone()
    }

    pub fn status(&self) -> ExportStatus {
        lock(&self.inner.state).status
    }

    pub fn progress(&self) -> f64 {
        self.inner.progress.get()
    }

    /// Terminal error of the last run, or the error recorded so far by the current one
    pub fn error(&self) -> Option<ExportError> {
        let state = lock(&self.inner.state);
        match &state.run {
            Some(run) => run.errors.get(),
            None => state.last_error.clone(),
        }
    }

    /// Estimated output bytes from the configured or derived bitrates. Audio
    /// falls back to the default encoder settings; 0 when no job is configured
    /// or the asset has no video track
    pub fn estimated_output_size(&self) -> u64 {
        let state = lock(&self.inner.state);
        let Some(job) = state.job.as_ref() else {
            return 0;
        };
        let audio_bit_rate = Some(job.audio_settings.clone().unwrap_or_default().bit_rate);
        let video_bit_rate = job.asset.primary_video_track().map(|track| {
            match &job.video_settings {
                Some(settings) => settings.compression.average_bit_rate,
                None => {
                    let render_size = match &job.video_composition {
                        Some(composition) => composition.render_size,
                        None => rotation_of(&track.preferred_transform).render_size(track.natural_size),
                    };
                    VideoSettingsDeriver::derive_video_settings(render_size, job.preset)
                        .compression
                        .average_bit_rate
                }
            }
        });
        SizeEstimator::estimated_output_size(audio_bit_rate, video_bit_rate, job.total_duration())
    }

    /// Start the configured job.
    ///
    /// `on_complete` runs exactly once. Setup failures (no output path, open
    /// failures) invoke it before `start` returns and yield `None`; otherwise
    /// the export runs on a spawned task whose handle is returned. Must be
    /// called from within a tokio runtime.
    pub fn start<F>(&self, on_complete: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(ExportReport) + Send + 'static,
    {
        let started_at = Instant::now();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                on_complete(self.rejected_report(
                    ExportError::invalid_state("export must be started inside a tokio runtime"),
                    started_at,
                ));
                return None;
            }
        };

        match self.prepare(started_at) {
            Ok(prepared) => {
                let session = self.clone();
                Some(runtime.spawn(async move {
                    let report = session.drive(prepared).await;
                    on_complete(report);
                    session.reset_transient();
                }))
            }
            Err(SetupFailure::Rejected(error)) => {
                on_complete(self.rejected_report(error, started_at));
                None
            }
            Err(SetupFailure::Failed(error)) => {
                let report = self.fail_setup(error, started_at);
                if let Some(observer) = self.observer() {
                    if let Some(error) = &report.error {
                        observer.on_error(&error.to_string());
                    }
                }
                on_complete(report);
                None
            }
        }
    }

    /// Run the configured job to its terminal state
    pub async fn export(&self) -> ExportReport {
        let (tx, rx) = oneshot::channel();
        self.start(move |report| {
            let _ = tx.send(report);
        });
        match rx.await {
            Ok(report) => report,
            Err(_) => self.current_report(Instant::now()),
        }
    }

    /// Request cancellation of the running export.
    ///
    /// Safe from any thread and idempotent. A cancel that arrives while
    /// `start` is still opening the reader and writer is applied as soon as
    /// the run begins; otherwise a no-op unless an export is reading and
    /// writing. Waits for each track's in-flight burst (video, then audio)
    /// before cancelling the reader and writer.
    pub fn cancel(&self) {
        let run = {
            let mut state = lock(&self.inner.state);
            if state.starting {
                debug!("cancel requested during setup");
                state.cancel_pending = true;
                return;
            }
            if state.status != ExportStatus::ReadingAndWriting {
                return;
            }
            match &state.run {
                Some(run) => run.clone(),
                None => return,
            }
        };
        if run.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cancelling export");
        run.cancel_tx.send_replace(true);

        for pipeline in [&run.video, &run.audio].into_iter().flatten() {
            let state = lock_pipeline(pipeline);
            if state.release_hold() {
                debug!(track = %state.kind(), "released completion hold on cancel");
            }
        }

        run.reader.cancel_reading();
        run.writer.cancel_writing();
    }

    fn observer(&self) -> Option<Arc<dyn ProgressCallback>> {
        lock(&self.inner.observer).clone()
    }

    fn prepare(&self, started_at: Instant) -> Result<PreparedRun, SetupFailure> {
        let job = {
            let mut state = lock(&self.inner.state);
            if state.status != ExportStatus::Idle || state.starting {
                return Err(SetupFailure::Rejected(ExportError::invalid_state(format!(
                    "cannot start a session that is {}; configure a new job first",
                    state.status
                ))));
            }
            let Some(job) = state.job.clone() else {
                return Err(SetupFailure::Rejected(ExportError::invalid_state(
                    "no export job configured",
                )));
            };
            if job.output_path.is_none() {
                return Err(SetupFailure::Failed(ExportError::configuration(
                    "output destination is not set",
                )));
            }
            state.starting = true;
            state.cancel_pending = false;
            job
        };

        let result = self.open_run(&job, started_at);
        let cancel_pending = {
            let mut state = lock(&self.inner.state);
            state.starting = false;
            std::mem::take(&mut state.cancel_pending)
        };
        if cancel_pending && result.is_ok() {
            self.cancel();
        }
        result
    }

    fn open_run(&self, job: &ExportJob, started_at: Instant) -> Result<PreparedRun, SetupFailure> {
        let Some(output_path) = job.output_path.clone() else {
            return Err(SetupFailure::Failed(ExportError::configuration(
                "output destination is not set",
            )));
        };

        if self.inner.fs.file_exists(&output_path) {
            info!(path = %output_path.display(), "removing existing output file");
            self.inner
                .fs
                .delete_file(&output_path)
                .map_err(SetupFailure::Failed)?;
        }

        let reader = self
            .inner
            .backend
            .open_reader(&job.asset, &job.time_range)
            .map_err(SetupFailure::Failed)?;
        let options = WriterOptions {
            network_optimized: job.network_optimized,
            metadata: job.metadata.clone(),
        };
        let writer = match self
            .inner
            .backend
            .open_writer(&output_path, job.container, &options)
        {
            Ok(writer) => writer,
            Err(error) => {
                reader.cancel_reading();
                return Err(SetupFailure::Failed(error));
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (group, completion_rx) = CompletionGroup::new();
        let handles = RunHandles {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx: Arc::new(cancel_tx),
            errors: Arc::new(ErrorSlot::new()),
            reader: Arc::clone(&reader),
            writer: Arc::clone(&writer),
            video: None,
            audio: None,
        };
        let total_duration = job.total_duration();
        let ctx = Arc::new(TrackContext {
            reader: Arc::clone(&reader),
            writer: Arc::clone(&writer),
            cancelled: Arc::clone(&handles.cancelled),
            cancel_rx,
            errors: Arc::clone(&handles.errors),
            progress: Arc::clone(&self.inner.progress),
            progress_tx,
            time_range_start: job.time_range.start,
            total_duration,
            processor: lock(&self.inner.processor).clone(),
        });

        let mut prepared = PreparedRun {
            handles,
            group,
            completion_rx,
            progress_rx,
            contexts: Vec::new(),
            output_path,
            total_duration,
            started_at,
        };

        let has_video = !job.asset.video_tracks.is_empty();
        let setup = self
            .add_audio_track(job, &mut prepared, &ctx, !has_video)
            .and_then(|_| self.add_video_track(job, &mut prepared, &ctx));
        if let Err(error) = setup {
            self.abandon(&prepared);
            return Err(SetupFailure::Failed(error));
        }

        if !reader.start_reading() {
            let message = reader.error().unwrap_or_else(|| "reader refused to start".to_string());
            self.abandon(&prepared);
            return Err(SetupFailure::Failed(ExportError::read(message)));
        }
        if !writer.start_writing() {
            let message = writer.error().unwrap_or_else(|| "writer refused to start".to_string());
            self.abandon(&prepared);
            return Err(SetupFailure::Failed(ExportError::write(message)));
        }
        writer.start_session(TimeSpec::zero());

        {
            let mut state = lock(&self.inner.state);
            state.status = ExportStatus::ReadingAndWriting;
            state.last_error = None;
            state.run = Some(prepared.handles.clone());
        }

        info!(
            source = %job.asset.source,
            output = %prepared.output_path.display(),
            preset = %job.preset,
            duration = %total_duration,
            tracks = prepared.contexts.len(),
            "export started"
        );
        Ok(prepared)
    }

    fn add_audio_track(
        &self,
        job: &ExportJob,
        prepared: &mut PreparedRun,
        ctx: &Arc<TrackContext>,
        drives_progress: bool,
    ) -> ExportResult<()> {
        let Some(first) = job.asset.primary_audio_track() else {
            return Ok(());
        };
        let settings = job.audio_settings.clone().unwrap_or_else(AudioSettings::default);
        let output_settings = AudioOutputSettings::default();
        let request = match &job.audio_mix {
            Some(mix) => OutputRequest::AudioMix {
                tracks: job.asset.audio_tracks.clone(),
                mix: mix.clone(),
                settings: output_settings,
            },
            None => OutputRequest::AudioTrack {
                track: first.clone(),
                settings: output_settings,
            },
        };
        let output = prepared
            .handles
            .reader
            .add_output(request)
            .ok_or_else(|| ExportError::open("audio output", "reader cannot produce the requested audio"))?;
        let input = prepared
            .handles
            .writer
            .add_input(InputRequest::Audio { settings })
            .ok_or_else(|| ExportError::open("audio input", "writer cannot accept the requested audio"))?;

        let pipeline = TrackPipeline::new(
            TrackKind::Audio,
            output,
            input,
            prepared.group.enter(),
            None,
            drives_progress,
        )
        .shared();
        prepared.handles.audio = Some(Arc::clone(&pipeline));
        prepared.contexts.push((pipeline, Arc::clone(ctx)));
        Ok(())
    }

    fn add_video_track(
        &self,
        job: &ExportJob,
        prepared: &mut PreparedRun,
        ctx: &Arc<TrackContext>,
    ) -> ExportResult<()> {
        let Some(track) = job.asset.primary_video_track() else {
            return Ok(());
        };
        let target_frame_rate = job
            .video_settings
            .as_ref()
            .and_then(VideoSettings::target_frame_rate);
        let composition = job
            .video_composition
            .clone()
            .or_else(|| build_default_composition(track, job.asset.duration, target_frame_rate));
        let render_size: Size = composition
            .as_ref()
            .map(|composition| composition.render_size)
            .unwrap_or(track.natural_size);
        let settings = job
            .video_settings
            .clone()
            .unwrap_or_else(|| VideoSettingsDeriver::derive_video_settings(render_size, job.preset));
        debug!(
            render = %render_size,
            encoded = %settings.size(),
            bit_rate = settings.compression.average_bit_rate,
            composed = composition.is_some(),
            "video track configured"
        );

        let output_settings = job.video_output_settings.unwrap_or_else(VideoOutputSettings::default);
        let request = match composition {
            Some(composition) => OutputRequest::VideoComposition {
                tracks: job.asset.video_tracks.clone(),
                composition,
                settings: output_settings,
            },
            None => OutputRequest::VideoTrack {
                track: track.clone(),
                settings: output_settings,
            },
        };
        let output = prepared
            .handles
            .reader
            .add_output(request)
            .ok_or_else(|| ExportError::open("video output", "reader cannot produce the requested video"))?;

        let hooked = ctx.processor.is_some();
        let attributes = hooked.then(|| PixelBufferAttributes::bgra(render_size));
        let input = prepared
            .handles
            .writer
            .add_input(InputRequest::Video {
                settings,
                pixel_buffer_attributes: attributes,
            })
            .ok_or_else(|| ExportError::open("video input", "writer cannot accept the requested video"))?;

        let pool: Option<Arc<dyn PixelBufferPool>> = match attributes {
            Some(attributes) => Some(
                input
                    .pixel_buffer_pool()
                    .unwrap_or_else(|| Arc::new(FramePool::new(attributes, DEFAULT_POOL_CAPACITY))),
            ),
            None => None,
        };

        let pipeline = TrackPipeline::new(
            TrackKind::Video,
            output,
            input,
            prepared.group.enter(),
            pool,
            true,
        )
        .shared();
        prepared.handles.video = Some(Arc::clone(&pipeline));
        prepared.contexts.push((pipeline, Arc::clone(ctx)));
        Ok(())
    }

    /// Tear down a run that failed before its pipelines started
    fn abandon(&self, prepared: &PreparedRun) {
        prepared.handles.reader.cancel_reading();
        prepared.handles.writer.cancel_writing();
        self.remove_partial_output(&prepared.output_path);
    }

    async fn drive(&self, prepared: PreparedRun) -> ExportReport {
        let PreparedRun {
            handles,
            group,
            mut completion_rx,
            mut progress_rx,
            contexts,
            output_path,
            total_duration,
            started_at,
        } = prepared;
        let observer = self.observer();
        if let Some(observer) = &observer {
            observer.on_start("export", total_duration);
        }

        for (pipeline, ctx) in contexts {
            tokio::spawn(run_pipeline(pipeline, ctx));
        }
        group.arm();

        loop {
            tokio::select! {
                biased;
                _ = &mut completion_rx => break,
                Some(event) = progress_rx.recv() => {
                    if let Some(observer) = &observer {
                        observer.on_progress(event.progress, event.position);
                    }
                }
            }
        }
        while let Ok(event) = progress_rx.try_recv() {
            if let Some(observer) = &observer {
                observer.on_progress(event.progress, event.position);
            }
        }
        debug!("all tracks finished");

        let writer = &handles.writer;
        let cancelled = || handles.cancelled.load(Ordering::Acquire);
        if !cancelled() && !handles.errors.is_set() && writer.status() == MediaStatus::Failed {
            let message = writer.error().unwrap_or_else(|| "writer failed".to_string());
            handles.errors.record(ExportError::write(message));
        }
        if !cancelled() && !handles.errors.is_set() && writer.status() != MediaStatus::Cancelled {
            if let Err(error) = writer.finish_writing().await {
                let error = match error {
                    ExportError::Finalize { .. } => error,
                    other => ExportError::finalize(other.to_string()),
                };
                handles.errors.record(error);
            }
        }

        let error = handles.errors.get();
        let status = if error.is_some() {
            ExportStatus::Failed
        } else if cancelled() {
            ExportStatus::Cancelled
        } else {
            ExportStatus::Completed
        };

        match status {
            ExportStatus::Completed => {
                self.inner.progress.set(1.0);
                info!(output = %output_path.display(), elapsed_ms = started_at.elapsed().as_millis() as u64, "export completed");
            }
            _ => {
                writer.cancel_writing();
                handles.reader.cancel_reading();
                self.remove_partial_output(&output_path);
                match &error {
                    Some(error) => error!(error = %error, "export failed"),
                    None => info!("export cancelled"),
                }
            }
        }

        {
            let mut state = lock(&self.inner.state);
            state.status = status;
            state.last_error = error.clone();
        }

        if let Some(observer) = &observer {
            match (&status, &error) {
                (ExportStatus::Completed, _) => {
                    observer.on_complete(Some(output_path.display().to_string()))
                }
                (_, Some(error)) => observer.on_error(&error.to_string()),
                _ => observer.on_cancel(),
            }
        }

        ExportReport {
            status,
            error,
            output_path: Some(output_path),
            progress: self.inner.progress.get(),
            duration: total_duration,
            elapsed: started_at.elapsed(),
        }
    }

    /// Drop the reader, writer and pipelines of the finished run
    fn reset_transient(&self) {
        let mut state = lock(&self.inner.state);
        if state.status.is_terminal() {
            state.run = None;
        }
    }

    fn fail_setup(&self, error: ExportError, started_at: Instant) -> ExportReport {
        warn!(error = %error, "export setup failed");
        {
            let mut state = lock(&self.inner.state);
            state.status = ExportStatus::Failed;
            state.last_error = Some(error);
            state.run = None;
        }
        self.current_report(started_at)
    }

    /// Report for a start request refused without touching the session
    fn rejected_report(&self, error: ExportError, started_at: Instant) -> ExportReport {
        warn!(error = %error, "export start rejected");
        let mut report = self.current_report(started_at);
        report.error = Some(error);
        report
    }

    fn current_report(&self, started_at: Instant) -> ExportReport {
        let state = lock(&self.inner.state);
        let job = state.job.as_ref();
        ExportReport {
            status: state.status,
            error: state.last_error.clone(),
            output_path: job.and_then(|job| job.output_path.clone()),
            progress: self.inner.progress.get(),
            duration: job.map(ExportJob::total_duration).unwrap_or_default(),
            elapsed: started_at.elapsed(),
        }
    }

    fn remove_partial_output(&self, path: &std::path::Path) {
        if !self.inner.fs.file_exists(path) {
            return;
        }
        match self.inner.fs.delete_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed partial output"),
            Err(error) => warn!(path = %path.display(), error = %error, "failed to remove partial output"),
        }
    }
}

enum SetupFailure {
    /// The request was refused; session state is unchanged
    Rejected(ExportError),
    /// The run failed before draining; the session moves to `failed`
    Failed(ExportError),
}
