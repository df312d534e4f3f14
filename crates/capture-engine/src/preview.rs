//! Single-slot lossy preview hand-off.
//!
//! The capture loop publishes every frame; the display side takes whatever is
//! newest when it gets around to polling. Unread frames are overwritten, so
//! memory stays at one frame per camera no matter how slow the consumer is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::frame::Frame;

/// Latest-frame mailbox for one camera.
#[derive(Debug, Default)]
pub struct PreviewSlot {
    slot: Mutex<Option<Frame>>,
    published: AtomicU64,
    overwritten: AtomicU64,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any unread frame with `frame`. Never waits on the consumer.
    pub fn publish(&self, frame: Frame) {
        let previous = self.lock().replace(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the newest frame, leaving the slot empty.
    pub fn try_take(&self) -> Option<Frame> {
        self.lock().take()
    }

    /// Whether a frame is waiting.
    pub fn is_filled(&self) -> bool {
        self.lock().is_some()
    }

    /// Total frames published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames discarded before anyone read them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        // The guarded section is a single swap; a poisoned slot still holds a valid Option.
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}
