//! Error handling module for Reframe

use thiserror::Error;

/// Main error type for export operations
///
/// Cancellation is not represented here: a cancelled job ends in
/// [`crate::domain::model::ExportStatus::Cancelled`] with no error payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    /// Job parameters are missing or invalid; reported before any I/O starts
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The reader or the writer could not be opened
    #[error("Failed to open {what}: {message}")]
    Open { what: String, message: String },

    /// The reader failed while samples were being drained
    #[error("Read failed: {message}")]
    Read { message: String },

    /// The writer rejected samples while they were being drained
    #[error("Write failed: {message}")]
    Write { message: String },

    /// The writer failed while flushing and closing the container
    #[error("Failed to finalize output: {message}")]
    Finalize { message: String },

    /// Operation not allowed in the session's current state
    #[error("Invalid session state: {message}")]
    InvalidState { message: String },

    /// Media probe error
    #[error("Failed to probe media file: {message}")]
    Probe { message: String },

    /// I/O error
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl ExportError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn open(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Open {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    pub fn finalize(message: impl Into<String>) -> Self {
        Self::Finalize {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Whether this error came from the reader side of the pipeline
    pub fn is_read_error(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "libav")]
impl From<ffmpeg_next::Error> for ExportError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Probe {
            message: err.to_string(),
        }
    }
}

/// Result type alias for export operations
pub type ExportResult<T> = std::result::Result<T, ExportError>;
