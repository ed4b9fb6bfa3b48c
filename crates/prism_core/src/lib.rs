//! # PRISM Core
//!
//! The allocation-free foundation under the PRISM frame pipeline:
//! - Capacity-bounded pools for objects, growable lists and arrays
//! - Per-frame scratch slabs
//! - Synchronization primitives shared by the preparation and draw threads
//!
//! ## Architecture Rules
//!
//! 1. **Steady state never touches the heap** - Everything a frame needs is
//!    recycled through a pool
//! 2. **An object is live or pooled, never both** - Release moves ownership
//!    back into the pool
//! 3. **Every wait is bounded** - A stuck producer becomes an error, not a hang
//!
//! ## Example
//!
//! ```rust,ignore
//! use prism_core::ObjectPool;
//!
//! let pool = ObjectPool::new(512, || Vec::<u32>::with_capacity(64));
//! let list = pool.allocate();
//! pool.release(list);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod sync;

pub use memory::{
    ArrayPool, ArrayPoolStats, ListPool, ListPoolConfig, ObjectPool, PoolStats, SlabSet, SlabSpan,
};
pub use sync::{CompletionCell, DoubleBuffer, SyncError, SyncResult, TimedLock, TimedLockGuard};
