//! # Buffer Generator
//!
//! Thread-safe allocator that hands out regions of growable vertex/index
//! arrays during preparation and uploads them into device buffers at flush.
//!
//! ## Frame Cycle
//!
//! ```text
//! reset ──► allocate × N (any thread) ──► write regions ──► flush ──► issue
//!   │                                                         │
//!   └── age device buffers                copy-forward, upload ┘
//! ```
//!
//! ## Invariants
//!
//! - Software buffer regions never overlap
//! - A device buffer is only bound once every region assigned to it has
//!   been uploaded
//! - Allocation and writes are rejected after flush until the next reset

mod array;
mod cached;
mod generator;

pub use cached::CachedBuffer;
pub use generator::{BufferBinding, BufferGenerator, BufferWriter, SoftwareBuffer};

pub(crate) use generator::ErasedGenerator;
