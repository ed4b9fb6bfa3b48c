//! # Prepare/Draw Double Buffer
//!
//! Two slots exchanged once per frame between the thread that prepares
//! frame N+1 and the thread that draws frame N.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────┐
//!                    │        DoubleBuffer         │
//!                    │                             │
//!                    │  ┌─────────┐  ┌─────────┐   │
//!                    │  │ Slot A  │  │ Slot B  │   │
//!                    │  └────┬────┘  └────┬────┘   │
//!                    │       │            │        │
//!                    │  ┌────┴────────────┴────┐   │
//!                    │  │   Atomic Index (0/1) │   │
//!                    │  └──────────────────────┘   │
//!                    └─────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!      ┌──────────────┐                ┌──────────────┐
//!      │ Prepare slot │                │  Draw slot   │
//!      │ (caller)     │                │ (draw thread)│
//!      └──────────────┘                └──────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! Each slot sits behind its own mutex, so the preparing thread and the draw
//! thread never contend unless one of them reaches across. `swap` flips the
//! slot roles and must only be called once the draw side is idle.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// A pair of slots whose prepare/draw roles flip on every swap.
///
/// ## Usage
///
/// ```rust,ignore
/// let buffers: DoubleBuffer<Arc<Frame>> = DoubleBuffer::new();
///
/// // Caller thread fills the prepare slot
/// buffers.prepare_slot().replace(frame);
///
/// // Once the previous draw is finished
/// buffers.swap();
///
/// // Draw thread works on the draw slot
/// let frame = buffers.draw_slot().clone();
/// ```
pub struct DoubleBuffer<T> {
    /// The two slots.
    slots: [Mutex<Option<T>>; 2],

    /// Index of the current prepare slot (0 or 1).
    /// Draw slot is always (prepare_index ^ 1).
    prepare_index: AtomicUsize,

    /// Number of swaps performed.
    frame_count: AtomicUsize,
}

impl<T> DoubleBuffer<T> {
    /// Creates a double buffer with both slots empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None)],
            prepare_index: AtomicUsize::new(0),
            frame_count: AtomicUsize::new(0),
        }
    }

    /// Returns the number of swaps performed.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Locks the slot owned by the preparing side.
    pub fn prepare_slot(&self) -> MutexGuard<'_, Option<T>> {
        let index = self.prepare_index.load(Ordering::Acquire);
        self.slots[index].lock()
    }

    /// Locks the slot owned by the drawing side.
    pub fn draw_slot(&self) -> MutexGuard<'_, Option<T>> {
        let index = self.prepare_index.load(Ordering::Acquire) ^ 1;
        self.slots[index].lock()
    }

    /// Flips the slot roles.
    ///
    /// What was being prepared becomes what is being drawn.
    ///
    /// # Returns
    ///
    /// The new frame count.
    pub fn swap(&self) -> usize {
        self.prepare_index.fetch_xor(1, Ordering::AcqRel);
        self.frame_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Empties both slots and returns their contents.
    pub fn drain(&self) -> (Option<T>, Option<T>) {
        let prepared = self.prepare_slot().take();
        let drawn = self.draw_slot().take();
        (prepared, drawn)
    }
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DoubleBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleBuffer")
            .field("prepare_index", &self.prepare_index.load(Ordering::Relaxed))
            .field("frame_count", &self.frame_count())
            .finish()
    }
}
