//! # Synchronization Primitives for the Frame Pipeline
//!
//! ## The Problem
//!
//! ```text
//! Caller thread:   fill frame N+1, then prepare it
//! Worker threads:  prepare chunks of frame N+1
//! Draw thread:     issue frame N to the device
//!
//! A stuck producer or a stuck draw must never hang the whole engine.
//! ```
//!
//! ## The Solution
//!
//! - [`CompletionCell`]: single-assignment hand-off with a bounded wait
//! - [`TimedLock`]: a mutex whose acquisition times out with an error
//! - [`DoubleBuffer`]: the prepare/draw slot pair swapped once per frame

mod completion;
mod double_buffer;
mod timed_lock;

pub use completion::CompletionCell;
pub use double_buffer::DoubleBuffer;
pub use timed_lock::{TimedLock, TimedLockGuard};

use thiserror::Error;

/// Errors raised by the synchronization primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A timed lock could not be acquired in time.
    #[error("spent more than {waited_ms} ms waiting for the {name} lock")]
    LockTimeout {
        /// Lock name.
        name: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A completion cell was not completed in time.
    #[error("completion not signalled within {waited_ms} ms")]
    CompletionTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
