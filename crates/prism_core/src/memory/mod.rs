//! # Memory Management
//!
//! Pools and slabs that keep the frame loop off the allocator.
//!
//! ## Design Philosophy
//!
//! Objects are allocated on first use and recycled afterwards. During a
//! steady-state frame:
//! - Batches, lists and frames come out of pools
//! - Temporary per-frame data lives in slabs that are reset in bulk
//! - Pools are capacity-bounded, excess objects are simply dropped

mod array_pool;
mod list_pool;
mod pool;
mod slab;

pub use array_pool::{ArrayPool, ArrayPoolStats};
pub use list_pool::{ListPool, ListPoolConfig};
pub use pool::{ObjectPool, PoolStats};
pub use slab::{SlabSet, SlabSpan};
