//! Core export engine module

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::model::TimeSpec;
use crate::error::ExportError;

pub mod completion;
pub mod pool;
pub mod progress;
pub mod session;
pub mod track;

pub use session::{ExportReport, ExportSession};

/// Progress advance reported by the pacing track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Overall progress in `[0, 1]`
    pub progress: f64,
    /// Zero-based presentation time of the sample that moved it
    pub position: TimeSpec,
}

/// Terminal error of one export run.
///
/// The first error recorded wins, except that a reader failure replaces an
/// earlier writer failure.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    slot: Mutex<Option<ExportError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error`; returns whether it became the terminal error
    pub fn record(&self, error: ExportError) -> bool {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let replace = match slot.as_ref() {
            None => true,
            Some(ExportError::Write { .. }) => error.is_read_error(),
            Some(_) => false,
        };
        if replace {
            *slot = Some(error);
        }
        replace
    }

    pub fn get(&self) -> Option<ExportError> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let slot = ErrorSlot::new();
        assert!(slot.record(ExportError::finalize("disk full")));
        assert!(!slot.record(ExportError::write("late")));
        assert_eq!(slot.get(), Some(ExportError::finalize("disk full")));
    }

    #[test]
    fn test_read_error_replaces_write_error() {
        let slot = ErrorSlot::new();
        slot.record(ExportError::write("input rejected sample"));
        assert!(slot.record(ExportError::read("corrupt packet")));
        assert_eq!(slot.get(), Some(ExportError::read("corrupt packet")));
        assert!(!slot.record(ExportError::write("again")));
    }

    #[test]
    fn test_read_error_does_not_replace_other_errors() {
        let slot = ErrorSlot::new();
        slot.record(ExportError::open("writer", "permission denied"));
        assert!(!slot.record(ExportError::read("corrupt packet")));
        assert!(matches!(slot.get(), Some(ExportError::Open { .. })));
    }
}
