//! Progress tracking and callback system for UI integration

use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::domain::model::TimeSpec;

/// Progress callback trait for UI integration.
///
/// Callbacks registered on an export session are always invoked on the task
/// driving the export, never from a track context.
pub trait ProgressCallback: Send + Sync {
    /// Called when the pipelines start draining
    fn on_start(&self, operation: &str, total_duration: TimeSpec);

    /// Called after each progress advance
    fn on_progress(&self, progress: f64, position: TimeSpec);

    /// Called when the export completes successfully
    fn on_complete(&self, message: Option<String>);

    /// Called when the export fails
    fn on_error(&self, error: &str);

    /// Called when the export is cancelled
    fn on_cancel(&self);
}

/// Monotonic progress value in `[0, 1]`, readable from any thread.
///
/// Stored as `f64` bits so readers never take a lock.
#[derive(Debug, Default)]
pub struct ProgressCell {
    bits: AtomicU64,
}

impl ProgressCell {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Advance to `position / total`; never moves backwards.
    ///
    /// Returns the new value when it changed.
    pub fn advance(&self, position: TimeSpec, total: TimeSpec) -> Option<f64> {
        let candidate = Self::ratio(position, total);
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if candidate <= f64::from_bits(current) {
                return None;
            }
            match self.bits.compare_exchange_weak(
                current,
                candidate.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(candidate),
                Err(actual) => current = actual,
            }
        }
    }

    /// Force the value, used for the final 1.0 on completion and for resets
    pub fn set(&self, value: f64) {
        self.bits
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    fn ratio(position: TimeSpec, total: TimeSpec) -> f64 {
        if total.seconds <= 0.0 || !total.seconds.is_finite() {
            return 1.0;
        }
        let ratio = position.seconds / total.seconds;
        if ratio.is_nan() {
            return 0.0;
        }
        ratio.clamp(0.0, 1.0)
    }
}

/// Console progress callback for CLI usage
pub struct ConsoleProgressCallback {
    verbose: bool,
    last_percent: AtomicU8,
}

impl ConsoleProgressCallback {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_percent: AtomicU8::new(0),
        }
    }

    fn render_bar(progress: f64) -> String {
        let bar_length = 30;
        let filled = (progress * bar_length as f64) as usize;
        "#".repeat(filled) + &"-".repeat(bar_length - filled.min(bar_length))
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_start(&self, operation: &str, total_duration: TimeSpec) {
        self.last_percent.store(0, Ordering::Relaxed);
        eprintln!("Starting: {} ({})", operation, total_duration);
    }

    fn on_progress(&self, progress: f64, position: TimeSpec) {
        let percent = (progress * 100.0).floor() as u8;
        // redraw only when the whole percentage moves, unless verbose
        if !self.verbose && self.last_percent.swap(percent, Ordering::Relaxed) == percent {
            return;
        }
        eprint!(
            "\r[{}] {:>5.1}% {}",
            Self::render_bar(progress),
            progress * 100.0,
            position
        );
        let _ = std::io::stderr().flush();
    }

    fn on_complete(&self, message: Option<String>) {
        eprintln!();
        match message {
            Some(msg) => eprintln!("Completed: {}", msg),
            None => eprintln!("Export completed successfully"),
        }
    }

    fn on_error(&self, error: &str) {
        eprintln!();
        eprintln!("Error: {}", error);
    }

    fn on_cancel(&self) {
        eprintln!();
        eprintln!("Export cancelled");
    }
}

/// JSON-lines progress callback for structured output
pub struct JsonProgressCallback {
    output_progress_events: bool,
}

impl JsonProgressCallback {
    pub fn new(output_progress_events: bool) -> Self {
        Self {
            output_progress_events,
        }
    }
}

impl ProgressCallback for JsonProgressCallback {
    fn on_start(&self, operation: &str, total_duration: TimeSpec) {
        if self.output_progress_events {
            let event = serde_json::json!({
                "event": "start",
                "operation": operation,
                "total_seconds": total_duration.seconds,
                "timestamp": chrono::Utc::now().to_rfc3339()
            });
            println!("{}", event);
        }
    }

    fn on_progress(&self, progress: f64, position: TimeSpec) {
        if self.output_progress_events {
            let event = serde_json::json!({
                "event": "progress",
                "progress": progress,
                "position_seconds": position.seconds,
                "timestamp": chrono::Utc::now().to_rfc3339()
            });
            println!("{}", event);
        }
    }

    fn on_complete(&self, message: Option<String>) {
        let event = serde_json::json!({
            "event": "complete",
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        println!("{}", event);
    }

    fn on_error(&self, error: &str) {
        let event = serde_json::json!({
            "event": "error",
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        println!("{}", event);
    }

    fn on_cancel(&self) {
        let event = serde_json::json!({
            "event": "cancel",
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        println!("{}", event);
    }
}

/// No-op progress callback for when progress tracking is disabled
pub struct NoOpProgressCallback;

impl ProgressCallback for NoOpProgressCallback {
    fn on_start(&self, _operation: &str, _total_duration: TimeSpec) {}
    fn on_progress(&self, _progress: f64, _position: TimeSpec) {}
    fn on_complete(&self, _message: Option<String>) {}
    fn on_error(&self, _error: &str) {}
    fn on_cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_cell_is_monotonic() {
        let cell = ProgressCell::new();
        let total = TimeSpec::from_seconds(10.0);

        assert_eq!(cell.advance(TimeSpec::from_seconds(5.0), total), Some(0.5));
        assert_eq!(cell.advance(TimeSpec::from_seconds(2.0), total), None);
        assert_eq!(cell.get(), 0.5);
        assert_eq!(cell.advance(TimeSpec::from_seconds(5.0), total), None);
        assert_eq!(cell.advance(TimeSpec::from_seconds(7.5), total), Some(0.75));
    }

    #[test]
    fn test_progress_cell_clamps() {
        let cell = ProgressCell::new();
        let total = TimeSpec::from_seconds(10.0);
        assert_eq!(cell.advance(TimeSpec::from_seconds(-1.0), total), None);
        assert_eq!(cell.advance(TimeSpec::from_seconds(25.0), total), Some(1.0));
        assert_eq!(cell.get(), 1.0);
    }

    #[test]
    fn test_progress_cell_zero_total_means_done() {
        let cell = ProgressCell::new();
        assert_eq!(cell.advance(TimeSpec::zero(), TimeSpec::zero()), Some(1.0));
    }

    #[test]
    fn test_progress_cell_concurrent_advances_keep_maximum() {
        let cell = Arc::new(ProgressCell::new());
        let total = TimeSpec::from_seconds(1000.0);
        let handles: Vec<_> = (0..4)
            .map(|offset| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for step in (offset..1000).step_by(4) {
                        cell.advance(TimeSpec::from_seconds(step as f64), total);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cell.get(), 999.0 / 1000.0);
    }

    #[test]
    fn test_progress_cell_set_resets() {
        let cell = ProgressCell::new();
        cell.set(0.8);
        assert_eq!(cell.get(), 0.8);
        cell.set(0.0);
        assert_eq!(cell.get(), 0.0);
        cell.set(3.0);
        assert_eq!(cell.get(), 1.0);
    }
}
