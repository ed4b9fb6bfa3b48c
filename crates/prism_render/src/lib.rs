//! # PRISM Render
//!
//! Frame preparation and buffer upload for a real-time renderer: turns an
//! unordered stream of draw requests into sorted, combined, device-ready
//! batches while frame N+1 is prepared on the caller's thread and frame N
//! is issued on a dedicated draw thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RenderCoordinator                       │
//! │   begin_frame ─► end_draw ─► (swap) ─► draw thread: issue    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        RenderManager                         │
//! │   batch pools · list pools · frame pool · buffer generators  │
//! ├───────────────────────┬──────────────────────────────────────┤
//! │  Frame ─► combine ─►  │  PrepareManager (rayon workers)      │
//! │  sort ─► prepare      │  BufferGenerator<V> ─► GraphicsDevice│
//! └───────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! ## Rules
//!
//! - Batches are issued in (layer, material, creation index) order no
//!   matter how many workers prepared them
//! - A batch is issued only after it was prepared in the same frame, and
//!   never after it was released
//! - Software buffer ranges handed out in one frame never overlap
//! - Device loss skips issuance; it is never an error

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod batch;
pub mod buffer;
pub mod combine;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod frame;
pub mod manager;
pub mod prepare;
pub mod stats;

pub use batch::{
    Batch, BatchContainer, BatchKind, BatchPhase, BatchPool, BatchRef, BatchSnapshot, ContainerId,
    QuadItem, SortKey, Vertex,
};
pub use buffer::{BufferBinding, BufferGenerator, CachedBuffer, SoftwareBuffer};
pub use combine::{BatchCombiner, GeometryCombiner};
pub use config::RenderConfig;
pub use coordinator::RenderCoordinator;
pub use device::{GraphicsDevice, HeadlessDevice};
pub use error::{RenderError, RenderResult};
pub use frame::{Frame, FrameState};
pub use manager::RenderManager;
pub use prepare::{PrepareContext, PrepareManager};
pub use stats::{FrameStats, GeneratorStats};
