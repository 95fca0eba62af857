// Ports - Interface definitions (contracts)

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config_initialization::AppConfig;
use crate::domain::composition::{AudioMix, VideoComposition};
use crate::domain::media::{PixelBuffer, SampleBuffer};
use crate::domain::model::{
    AssetInfo, AudioTrackInfo, ContainerKind, MediaStatus, MetadataItem, TimeRange, TimeSpec,
    TrackKind, VideoTrackInfo,
};
use crate::domain::settings::{
    AudioOutputSettings, AudioSettings, PixelBufferAttributes, VideoOutputSettings, VideoSettings,
};
use crate::error::ExportResult;

/// Port for the media framework that reads and writes containers
pub trait MediaBackend: Send + Sync {
    /// Open a reader over `time_range` of `asset`
    fn open_reader(
        &self,
        asset: &AssetInfo,
        time_range: &TimeRange,
    ) -> ExportResult<Arc<dyn MediaReader>>;

    /// Open a writer producing `destination`
    fn open_writer(
        &self,
        destination: &Path,
        container: ContainerKind,
        options: &WriterOptions,
    ) -> ExportResult<Arc<dyn MediaWriter>>;
}

/// Container-level writer options
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Move the index to the front of the file so playback can start before download finishes
    pub network_optimized: bool,
    pub metadata: Vec<MetadataItem>,
}

/// What a reader output should produce
#[derive(Debug, Clone)]
pub enum OutputRequest {
    /// Decoded frames of one video track
    VideoTrack {
        track: VideoTrackInfo,
        settings: VideoOutputSettings,
    },
    /// Frames of the given tracks rendered through a composition
    VideoComposition {
        tracks: Vec<VideoTrackInfo>,
        composition: VideoComposition,
        settings: VideoOutputSettings,
    },
    /// Decoded PCM of one audio track
    AudioTrack {
        track: AudioTrackInfo,
        settings: AudioOutputSettings,
    },
    /// PCM of all given tracks mixed down with per-track volumes
    AudioMix {
        tracks: Vec<AudioTrackInfo>,
        mix: AudioMix,
        settings: AudioOutputSettings,
    },
}

impl OutputRequest {
    pub fn kind(&self) -> TrackKind {
        match self {
            OutputRequest::VideoTrack { .. } | OutputRequest::VideoComposition { .. } => {
                TrackKind::Video
            }
            OutputRequest::AudioTrack { .. } | OutputRequest::AudioMix { .. } => TrackKind::Audio,
        }
    }
}

/// What a writer input should accept
#[derive(Debug, Clone)]
pub enum InputRequest {
    Video {
        settings: VideoSettings,
        /// Frames handed to the per-frame hook; set when the hook path is active
        pixel_buffer_attributes: Option<PixelBufferAttributes>,
    },
    Audio {
        settings: AudioSettings,
    },
}

impl InputRequest {
    pub fn kind(&self) -> TrackKind {
        match self {
            InputRequest::Video { .. } => TrackKind::Video,
            InputRequest::Audio { .. } => TrackKind::Audio,
        }
    }
}

/// Demuxer/decoder over one asset
pub trait MediaReader: Send + Sync {
    /// Register an output; `None` when the reader cannot produce it
    fn add_output(&self, request: OutputRequest) -> Option<Arc<dyn ReaderOutput>>;

    fn start_reading(&self) -> bool;

    fn status(&self) -> MediaStatus;

    /// Description of the failure once `status` is `Failed`
    fn error(&self) -> Option<String>;

    fn cancel_reading(&self);
}

/// One track's sample stream
pub trait ReaderOutput: Send + Sync {
    /// Next sample in presentation order; `None` once exhausted, failed or cancelled.
    ///
    /// May block while the sample is decoded.
    fn copy_next_sample(&self) -> Option<SampleBuffer>;
}

/// Encoder/muxer producing one output file
#[async_trait]
pub trait MediaWriter: Send + Sync {
    /// Register an input; `None` when the writer cannot accept it
    fn add_input(&self, request: InputRequest) -> Option<Arc<dyn WriterInput>>;

    fn start_writing(&self) -> bool;

    fn start_session(&self, at: TimeSpec);

    /// Flush and close the container
    async fn finish_writing(&self) -> ExportResult<()>;

    /// Abort writing; the output file is left for the caller to remove
    fn cancel_writing(&self);

    fn status(&self) -> MediaStatus;

    /// Description of the failure once `status` is `Failed`
    fn error(&self) -> Option<String>;
}

/// One track's sink inside a writer
#[async_trait]
pub trait WriterInput: Send + Sync {
    /// Resolve once the input can take more data, or can never take more
    /// (finished, failed or cancelled)
    async fn ready_for_more_media_data(&self);

    fn is_ready_for_more_media_data(&self) -> bool;

    fn append_sample(&self, sample: SampleBuffer) -> bool;

    fn append_pixel_buffer(&self, buffer: PixelBuffer, presentation_time: TimeSpec) -> bool;

    fn mark_as_finished(&self);

    /// Pool supplied by the writer for hook destination frames
    fn pixel_buffer_pool(&self) -> Option<Arc<dyn PixelBufferPool>> {
        None
    }
}

/// Allocator of reusable image buffers of one format and size
pub trait PixelBufferPool: Send + Sync {
    /// A free buffer, or `None` when the pool is exhausted
    fn allocate(&self) -> Option<PixelBuffer>;

    fn attributes(&self) -> PixelBufferAttributes;
}

/// Caller-supplied per-frame transform, run on the video track's context
pub trait FrameProcessor: Send + Sync {
    fn process_frame(
        &self,
        source: &PixelBuffer,
        presentation_time: TimeSpec,
        destination: &mut PixelBuffer,
    );
}

impl<F> FrameProcessor for F
where
    F: Fn(&PixelBuffer, TimeSpec, &mut PixelBuffer) + Send + Sync,
{
    fn process_frame(
        &self,
        source: &PixelBuffer,
        presentation_time: TimeSpec,
        destination: &mut PixelBuffer,
    ) {
        self(source, presentation_time, destination)
    }
}

/// Port for file system operations
pub trait FsPort: Send + Sync {
    fn file_exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> ExportResult<u64>;

    /// Delete a file; deleting a missing file succeeds
    fn delete_file(&self, path: &Path) -> ExportResult<()>;
}

/// Port for configuration files
#[async_trait]
pub trait ConfigPort: Send + Sync {
    /// Load and validate a configuration file
    async fn load_config(&self, path: &Path) -> ExportResult<AppConfig>;

    /// Serialize a configuration to `path`
    async fn save_config(&self, config: &AppConfig, path: &Path) -> ExportResult<()>;
}
