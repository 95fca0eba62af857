//! Per-track drain loop: reader output → optional frame hook → writer input.
//!
//! Each pipeline's state sits behind its own mutex, which is the track's serial
//! context. The drain loop holds it for one burst of appends; `cancel()` takes
//! it to hand off with any burst in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::media::SampleBuffer;
use crate::domain::model::{MediaStatus, TimeSpec, TrackKind};
use crate::engine::completion::CompletionHold;
use crate::engine::progress::ProgressCell;
use crate::engine::{ErrorSlot, ProgressEvent};
use crate::error::ExportError;
use crate::ports::{FrameProcessor, MediaReader, MediaWriter, PixelBufferPool, ReaderOutput, WriterInput};

/// State shared by both tracks of one run
pub struct TrackContext {
    pub reader: Arc<dyn MediaReader>,
    pub writer: Arc<dyn MediaWriter>,
    pub cancelled: Arc<AtomicBool>,
    pub cancel_rx: watch::Receiver<bool>,
    pub errors: Arc<ErrorSlot>,
    pub progress: Arc<ProgressCell>,
    pub progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    /// Source time that maps to zero in the output
    pub time_range_start: TimeSpec,
    pub total_duration: TimeSpec,
    pub processor: Option<Arc<dyn FrameProcessor>>,
}

impl TrackContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct TrackPipeline {
    kind: TrackKind,
    output: Arc<dyn ReaderOutput>,
    input: Arc<dyn WriterInput>,
    hold: CompletionHold,
    pool: Option<Arc<dyn PixelBufferPool>>,
    /// Whether this track's timestamps drive overall progress
    drives_progress: bool,
    last_presentation_time: Option<TimeSpec>,
    appended: u64,
    finished: bool,
}

pub type SharedPipeline = Arc<Mutex<TrackPipeline>>;

/// Lock a pipeline, recovering the state if a hook panicked mid-burst
pub fn lock_pipeline(pipeline: &SharedPipeline) -> MutexGuard<'_, TrackPipeline> {
    match pipeline.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TrackPipeline {
    pub fn new(
        kind: TrackKind,
        output: Arc<dyn ReaderOutput>,
        input: Arc<dyn WriterInput>,
        hold: CompletionHold,
        pool: Option<Arc<dyn PixelBufferPool>>,
        drives_progress: bool,
    ) -> Self {
        Self {
            kind,
            output,
            input,
            hold,
            pool,
            drives_progress,
            last_presentation_time: None,
            appended: 0,
            finished: false,
        }
    }

    pub fn shared(self) -> SharedPipeline {
        Arc::new(Mutex::new(self))
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn input(&self) -> Arc<dyn WriterInput> {
        Arc::clone(&self.input)
    }

    /// Give up this track's claim on job completion; a second call is a no-op
    pub fn release_hold(&self) -> bool {
        self.hold.release()
    }

    /// Drain samples while the input is ready. Returns `true` once the track is
    /// finished and the loop should stop.
    fn drain(&mut self, ctx: &TrackContext) -> bool {
        if self.finished {
            return true;
        }
        loop {
            if ctx.is_cancelled() {
                self.finish_cancelled();
                return true;
            }
            if !self.input.is_ready_for_more_media_data() {
                // a writer that stopped writing will never become ready again
                if matches!(ctx.writer.status(), MediaStatus::Failed | MediaStatus::Cancelled) {
                    self.finish(ctx, false);
                    return true;
                }
                return false;
            }
            let Some(sample) = self.output.copy_next_sample() else {
                self.finish(ctx, false);
                return true;
            };

            let adjusted = sample.presentation_time - ctx.time_range_start;
            let appended = match self.kind {
                TrackKind::Video => self.append_video(sample, adjusted, ctx),
                TrackKind::Audio => self.input.append_sample(sample.retimed(adjusted)),
            };
            if !appended {
                self.finish(ctx, true);
                return true;
            }

            self.appended += 1;
            self.last_presentation_time = Some(adjusted);
            if self.drives_progress {
                if let Some(progress) = ctx.progress.advance(adjusted, ctx.total_duration) {
                    let _ = ctx.progress_tx.send(ProgressEvent {
                        progress,
                        position: adjusted,
                    });
                }
            }
        }
    }

    fn append_video(&self, sample: SampleBuffer, adjusted: TimeSpec, ctx: &TrackContext) -> bool {
        if let (Some(processor), Some(pool), Some(source)) =
            (&ctx.processor, &self.pool, sample.image_buffer())
        {
            if let Some(mut destination) = pool.allocate() {
                processor.process_frame(source, adjusted, &mut destination);
                return self.input.append_pixel_buffer(destination, adjusted);
            }
            debug!(time = %adjusted, "frame pool exhausted, appending source frame");
        }
        self.input.append_sample(sample.retimed(adjusted))
    }

    /// End of this track: surface reader/writer failures, close the input and
    /// release the completion hold
    fn finish(&mut self, ctx: &TrackContext, append_rejected: bool) {
        if ctx.reader.status() == MediaStatus::Failed {
            let message = ctx
                .reader
                .error()
                .unwrap_or_else(|| "reader failed".to_string());
            warn!(track = %self.kind, error = %message, "reader failed");
            ctx.errors.record(ExportError::read(message));
        } else {
            match ctx.writer.status() {
                MediaStatus::Failed => {
                    let message = ctx
                        .writer
                        .error()
                        .unwrap_or_else(|| "writer failed".to_string());
                    warn!(track = %self.kind, error = %message, "writer failed");
                    ctx.errors.record(ExportError::write(message));
                }
                MediaStatus::Cancelled => {}
                _ if append_rejected && !ctx.is_cancelled() => {
                    let at = self.last_presentation_time.unwrap_or_default();
                    ctx.errors.record(ExportError::write(format!(
                        "{} input rejected a sample after {}",
                        self.kind, at
                    )));
                }
                _ => {}
            }
        }
        debug!(track = %self.kind, appended = self.appended, "track finished");
        self.close();
    }

    fn finish_cancelled(&mut self) {
        debug!(track = %self.kind, appended = self.appended, "track cancelled");
        self.close();
    }

    fn close(&mut self) {
        if !self.finished {
            self.input.mark_as_finished();
            self.finished = true;
        }
        self.release_hold();
    }
}

/// Drive one track until it finishes or the run is cancelled.
///
/// Waits for writer readiness without holding the track's lock, then drains a
/// burst on the blocking pool since pulls may decode and hooks may be slow.
pub async fn run_pipeline(pipeline: SharedPipeline, ctx: Arc<TrackContext>) {
    let input = lock_pipeline(&pipeline).input();
    let kind = lock_pipeline(&pipeline).kind();
    let mut cancel_rx = ctx.cancel_rx.clone();

    loop {
        if ctx.is_cancelled() {
            lock_pipeline(&pipeline).finish_cancelled();
            break;
        }

        tokio::select! {
            biased;
            changed = cancel_rx.wait_for(|cancelled| *cancelled) => {
                if changed.is_err() {
                    // the session dropped the run; nothing left to drain for
                    lock_pipeline(&pipeline).finish_cancelled();
                    break;
                }
                continue;
            }
            _ = input.ready_for_more_media_data() => {}
        }

        let burst_pipeline = Arc::clone(&pipeline);
        let burst_ctx = Arc::clone(&ctx);
        let burst = tokio::task::spawn_blocking(move || {
            lock_pipeline(&burst_pipeline).drain(&burst_ctx)
        })
        .await;

        match burst {
            Ok(true) => break,
            Ok(false) => {}
            Err(join_error) => {
                warn!(track = %kind, error = %join_error, "track drain aborted");
                ctx.errors.record(ExportError::write(format!(
                    "{} track stopped unexpectedly: {}",
                    kind, join_error
                )));
                lock_pipeline(&pipeline).close();
                break;
            }
        }
    }
}
