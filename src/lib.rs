//! Reframe media export library
//!
//! Exports one media asset to an H.264/AAC container through a resolution
//! preset, correcting the rotation stored in the video track. An
//! [`ExportSession`] drives one reader/writer pair with a pipeline per track,
//! reports monotonic progress and can be cancelled from any thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reframe_cli::adapters::MemoryBackend;
//! use reframe_cli::adapters::memory::synthetic_asset;
//! use reframe_cli::domain::model::{ExportJob, Size};
//! use reframe_cli::domain::orientation::Rotation;
//! use reframe_cli::domain::rules::Preset;
//! use reframe_cli::ExportSession;
//!
//! # async fn run() -> reframe_cli::ExportResult<()> {
//! let asset = synthetic_asset(10.0, Size::new(1920, 1080), Rotation::Deg90, 30.0, true);
//! let session = ExportSession::with_backend(Arc::new(MemoryBackend::new()));
//! session.configure(ExportJob::new(asset, Preset::P720).with_output("out.mp4"))?;
//! let report = session.export().await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cli;
pub mod config_initialization;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ports;
pub mod utils;

// Re-export commonly used types
pub use domain::model::{AssetInfo, ExportJob, ExportStatus, TimeRange, TimeSpec};
pub use domain::rules::Preset;
pub use engine::{ExportReport, ExportSession};
pub use error::{ExportError, ExportResult};
