//! Join point for the track pipelines.
//!
//! An atomic count of outstanding holds fires a oneshot exactly once when it
//! reaches zero. The group starts with one setup hold so that a track finishing
//! while the others are still being configured cannot fire it early.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

pub struct CompletionGroup {
    outstanding: AtomicUsize,
    notify: Mutex<Option<oneshot::Sender<()>>>,
}

impl CompletionGroup {
    /// New group holding only the setup hold, and the receiver that resolves
    /// once every hold is released
    pub fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let group = Arc::new(Self {
            outstanding: AtomicUsize::new(1),
            notify: Mutex::new(Some(tx)),
        });
        (group, rx)
    }

    /// Take a hold for one track
    pub fn enter(self: &Arc<Self>) -> CompletionHold {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        CompletionHold {
            group: Arc::clone(self),
            pending: AtomicBool::new(true),
        }
    }

    /// Release the setup hold once every track has entered
    pub fn arm(&self) {
        self.leave();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn leave(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        trace!(remaining = previous.saturating_sub(1), "completion hold released");
        if previous == 1 {
            let sender = match self.notify.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
        }
    }
}

/// One track's claim on the group; released at most once
pub struct CompletionHold {
    group: Arc<CompletionGroup>,
    pending: AtomicBool,
}

impl CompletionHold {
    /// Release the hold. Returns `false` when it was already released.
    pub fn release(&self) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            self.group.leave();
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Drop for CompletionHold {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_after_all_holds_and_arm() {
        let (group, mut rx) = CompletionGroup::new();
        let audio = group.enter();
        let video = group.enter();

        assert!(audio.release());
        assert!(rx.try_recv().is_err());
        group.arm();
        assert!(rx.try_recv().is_err());
        assert!(video.release());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_double_release_is_ignored() {
        let (group, rx) = CompletionGroup::new();
        let hold = group.enter();
        let other = group.enter();
        group.arm();

        assert!(hold.release());
        assert!(!hold.release());
        assert_eq!(group.outstanding(), 1);
        assert!(other.is_pending());
        drop(other);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_no_tracks_fires_on_arm() {
        let (group, rx) = CompletionGroup::new();
        group.arm();
        assert!(rx.await.is_ok());
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_release_fires_once() {
        let (group, mut rx) = CompletionGroup::new();
        let hold = Arc::new(group.enter());
        group.arm();

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let hold = Arc::clone(&hold);
                std::thread::spawn(move || hold.release())
            })
            .collect();
        let released: usize = racers
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();

        assert_eq!(released, 1);
        assert_eq!(group.outstanding(), 0);
        assert!(rx.try_recv().is_ok());
    }
}
