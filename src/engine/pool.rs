//! Bounded pool of reusable frames for the per-frame hook

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::media::{FrameRecycler, PixelBuffer};
use crate::domain::settings::PixelBufferAttributes;
use crate::ports::PixelBufferPool;

/// Frames kept in flight when the writer supplies no pool of its own
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Hands out at most `capacity` frames at a time.
///
/// A frame's storage returns to the free list when the frame is dropped, so a
/// steady-state export allocates only `capacity` frames in total.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    attributes: PixelBufferAttributes,
    frame_len: usize,
    capacity: usize,
    outstanding: AtomicUsize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl FramePool {
    pub fn new(attributes: PixelBufferAttributes, capacity: usize) -> Self {
        let frame_len = attributes
            .pixel_format
            .frame_len(attributes.width, attributes.height);
        Self {
            shared: Arc::new(PoolShared {
                attributes,
                frame_len,
                capacity,
                outstanding: AtomicUsize::new(0),
                free: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    /// Frames currently leased out
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn try_reserve(&self) -> bool {
        self.shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.shared.capacity).then_some(current + 1)
            })
            .is_ok()
    }
}

impl PixelBufferPool for FramePool {
    fn allocate(&self) -> Option<PixelBuffer> {
        if !self.try_reserve() {
            return None;
        }
        let recycled = match self.shared.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        let data = recycled.unwrap_or_else(|| vec![0; self.shared.frame_len]);
        let attributes = self.shared.attributes;
        Some(PixelBuffer::pooled(
            attributes.width,
            attributes.height,
            attributes.pixel_format,
            data,
            self.shared.clone(),
        ))
    }

    fn attributes(&self) -> PixelBufferAttributes {
        self.shared.attributes
    }
}

impl FrameRecycler for PoolShared {
    fn recycle(&self, data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if data.len() != self.frame_len {
            return;
        }
        let mut free = match self.free.lock() {
            Ok(free) => free,
            Err(poisoned) => poisoned.into_inner(),
        };
        if free.len() < self.capacity {
            free.push(data);
        }
    }
}
