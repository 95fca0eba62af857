use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::domain::media::{PixelBuffer, SampleBuffer};
use crate::domain::model::{ContainerKind, MediaStatus, MetadataItem, TimeSpec, TrackKind};
use crate::domain::settings::{AudioSettings, PixelBufferAttributes, VideoSettings};
use crate::engine::pool::FramePool;
use crate::error::{ExportError, ExportResult};
use crate::ports::{InputRequest, MediaWriter, PixelBufferPool, WriterInput, WriterOptions};

use super::MemoryScript;

/// What one writer input received
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackRecord {
    pub kind: Option<TrackKind>,
    pub video_settings: Option<VideoSettings>,
    pub audio_settings: Option<AudioSettings>,
    pub pixel_buffer_attributes: Option<PixelBufferAttributes>,
    /// Samples and pixel buffers accepted
    pub samples: u64,
    /// Of which appended as hook-rendered pixel buffers
    pub pixel_buffers: u64,
    pub first_time: Option<TimeSpec>,
    pub last_time: Option<TimeSpec>,
    /// Width and height of the last image appended
    pub last_frame_size: Option<(u32, u32)>,
    pub finished: bool,
}

/// What one writer produced; serialized into the output file on finalize
#[derive(Debug, Clone, Serialize)]
pub struct WriterRecord {
    pub path: PathBuf,
    pub container: ContainerKind,
    pub network_optimized: bool,
    pub metadata: Vec<MetadataItem>,
    pub session_start: Option<TimeSpec>,
    pub status: MediaStatus,
    pub tracks: Vec<TrackRecord>,
}

struct WriterShared {
    script: MemoryScript,
    status: Mutex<MediaStatus>,
    error: Mutex<Option<String>>,
}

impl WriterShared {
    fn status(&self) -> MediaStatus {
        self.status.lock().map(|status| *status).unwrap_or(MediaStatus::Failed)
    }

    fn transition(&self, from: &[MediaStatus], to: MediaStatus) -> bool {
        match self.status.lock() {
            Ok(mut status) if from.contains(&*status) => {
                *status = to;
                true
            }
            _ => false,
        }
    }

    fn fail(&self, message: String) {
        if let Ok(mut error) = self.error.lock() {
            error.get_or_insert(message);
        }
        self.transition(
            &[MediaStatus::Unknown, MediaStatus::InProgress],
            MediaStatus::Failed,
        );
    }
}

pub struct MemoryWriter {
    path: PathBuf,
    container: ContainerKind,
    options: WriterOptions,
    shared: Arc<WriterShared>,
    session_start: Mutex<Option<TimeSpec>>,
    inputs: Mutex<Vec<Arc<MemoryInput>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryWriter {
    /// Create the output file; it stays empty until `finish_writing`
    pub(super) fn create(
        path: &Path,
        container: ContainerKind,
        options: WriterOptions,
        script: MemoryScript,
    ) -> ExportResult<Self> {
        File::create(path)
            .map_err(|err| ExportError::open(path.display().to_string(), err.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            container,
            options,
            shared: Arc::new(WriterShared {
                script,
                status: Mutex::new(MediaStatus::Unknown),
                error: Mutex::new(None),
            }),
            session_start: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self) -> WriterRecord {
        WriterRecord {
            path: self.path.clone(),
            container: self.container,
            network_optimized: self.options.network_optimized,
            metadata: self.options.metadata.clone(),
            session_start: *lock(&self.session_start),
            status: self.shared.status(),
            tracks: lock(&self.inputs).iter().map(|input| input.record()).collect(),
        }
    }
}

#[async_trait]
impl MediaWriter for MemoryWriter {
    fn add_input(&self, request: InputRequest) -> Option<Arc<dyn WriterInput>> {
        if self.shared.status() != MediaStatus::Unknown {
            return None;
        }
        let input = Arc::new(MemoryInput::new(request, Arc::clone(&self.shared)));
        lock(&self.inputs).push(Arc::clone(&input));
        Some(input)
    }

    fn start_writing(&self) -> bool {
        if let Some(message) = &self.shared.script.fail_start_writing {
            self.shared.fail(message.clone());
            return false;
        }
        self.shared
            .transition(&[MediaStatus::Unknown], MediaStatus::InProgress)
    }

    fn start_session(&self, at: TimeSpec) {
        *lock(&self.session_start) = Some(at);
    }

    async fn finish_writing(&self) -> ExportResult<()> {
        if self.shared.status() != MediaStatus::InProgress {
            return Err(ExportError::finalize(format!(
                "writer is {:?}, not writing",
                self.shared.status()
            )));
        }
        if let Some(message) = &self.shared.script.fail_finish {
            self.shared.fail(message.clone());
            return Err(ExportError::finalize(message.clone()));
        }

        let mut record = self.record();
        record.status = MediaStatus::Completed;
        let summary = serde_json::to_vec_pretty(&record)
            .map_err(|err| ExportError::finalize(err.to_string()))?;
        std::fs::write(&self.path, summary)
            .map_err(|err| ExportError::finalize(err.to_string()))?;

        self.shared
            .transition(&[MediaStatus::InProgress], MediaStatus::Completed);
        debug!(path = %self.path.display(), "memory writer finalized");
        Ok(())
    }

    fn cancel_writing(&self) {
        self.shared.transition(
            &[MediaStatus::Unknown, MediaStatus::InProgress],
            MediaStatus::Cancelled,
        );
    }

    fn status(&self) -> MediaStatus {
        self.shared.status()
    }

    fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }
}

struct MemoryInput {
    shared: Arc<WriterShared>,
    request: InputRequest,
    pool: Option<Arc<dyn PixelBufferPool>>,
    /// Appends since the last readiness wait
    burst: AtomicUsize,
    finished: AtomicBool,
    record: Mutex<TrackRecord>,
}

impl MemoryInput {
    fn new(request: InputRequest, shared: Arc<WriterShared>) -> Self {
        let mut record = TrackRecord {
            kind: Some(request.kind()),
            ..TrackRecord::default()
        };
        let mut pool: Option<Arc<dyn PixelBufferPool>> = None;
        match &request {
            InputRequest::Video {
                settings,
                pixel_buffer_attributes,
            } => {
                record.video_settings = Some(settings.clone());
                record.pixel_buffer_attributes = *pixel_buffer_attributes;
                if let (Some(attributes), Some(capacity)) =
                    (pixel_buffer_attributes, shared.script.writer_pool_capacity)
                {
                    pool = Some(Arc::new(FramePool::new(*attributes, capacity)));
                }
            }
            InputRequest::Audio { settings } => {
                record.audio_settings = Some(settings.clone());
            }
        }
        Self {
            shared,
            request,
            pool,
            burst: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            record: Mutex::new(record),
        }
    }

    fn record(&self) -> TrackRecord {
        lock(&self.record).clone()
    }

    fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.shared.status() != MediaStatus::InProgress
    }

    fn accept(&self, time: TimeSpec, frame: Option<(u32, u32)>, pixel_buffer: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        let kind = self.request.kind();
        let mut record = lock(&self.record);

        if let Some((limit_kind, limit)) = self.shared.script.write_failure_after {
            if limit_kind == kind && record.samples >= limit {
                drop(record);
                self.shared.fail(format!("synthetic {} write failure", kind));
                return false;
            }
        }
        if record.last_time.is_some_and(|last| time < last) {
            drop(record);
            self.shared
                .fail(format!("{} timestamps went backwards at {}", kind, time));
            return false;
        }

        record.samples += 1;
        if pixel_buffer {
            record.pixel_buffers += 1;
        }
        record.first_time.get_or_insert(time);
        record.last_time = Some(time);
        if frame.is_some() {
            record.last_frame_size = frame;
        }
        self.burst.fetch_add(1, Ordering::AcqRel);
        true
    }
}

#[async_trait]
impl WriterInput for MemoryInput {
    async fn ready_for_more_media_data(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(delay) = self.shared.script.readiness_delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.burst.store(0, Ordering::Release);
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        !self.is_closed() && self.burst.load(Ordering::Acquire) < self.shared.script.ready_burst
    }

    fn append_sample(&self, sample: SampleBuffer) -> bool {
        let frame = sample
            .image_buffer()
            .map(|image| (image.width, image.height));
        self.accept(sample.presentation_time, frame, false)
    }

    fn append_pixel_buffer(&self, buffer: PixelBuffer, presentation_time: TimeSpec) -> bool {
        self.accept(presentation_time, Some((buffer.width, buffer.height)), true)
    }

    fn mark_as_finished(&self) {
        self.finished.store(true, Ordering::Release);
        lock(&self.record).finished = true;
    }

    fn pixel_buffer_pool(&self) -> Option<Arc<dyn PixelBufferPool>> {
        self.pool.clone()
    }
}
