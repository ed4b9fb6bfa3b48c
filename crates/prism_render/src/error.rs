//! # Render Error Types
//!
//! All errors that can occur while building, preparing and drawing frames.
//!
//! Usage-order violations (preparing an uninitialized batch, flushing twice,
//! drawing an unprepared frame) are reported immediately with the offending
//! state. Bounded waits that elapse become timeout errors. Device loss is
//! not an error: the coordinator absorbs it.

use prism_core::SyncError;
use thiserror::Error;

use crate::device::DeviceError;

/// Errors that can occur in the rendering core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A batch operation was attempted from the wrong lifecycle state.
    #[error("batch {batch}: expected state {expected}, found {actual}")]
    InvalidBatchState {
        /// Description of the batch.
        batch: String,
        /// The state(s) the operation requires.
        expected: &'static str,
        /// The state the batch was in.
        actual: String,
    },

    /// The batch has been released back to its pool.
    #[error("batch {0} has been released")]
    BatchReleased(String),

    /// The batch was merged into a sibling and may not be used again.
    #[error("batch {0} was combined into another batch")]
    BatchCombined(String),

    /// `suspend` was called twice.
    #[error("batch {0} is already suspended")]
    AlreadySuspended(String),

    /// The batch is already owned by a frame or group.
    #[error("batch {batch} is already owned by {container}")]
    AlreadyContained {
        /// Description of the batch.
        batch: String,
        /// Description of the current owner.
        container: String,
    },

    /// A suspended batch was not resumed in time.
    #[error("batch {batch} remained suspended for more than {waited_ms} ms")]
    SuspendTimeout {
        /// Description of the batch.
        batch: String,
        /// How long preparation waited.
        waited_ms: u64,
    },

    /// The operation does not apply to this kind of batch.
    #[error("batch {batch} does not support {operation}")]
    UnsupportedOperation {
        /// Description of the batch.
        batch: String,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A clear batch was configured to clear nothing.
    #[error("clear batch must clear at least one of color, depth or stencil")]
    EmptyClear,

    /// A frame operation was attempted from the wrong lifecycle state.
    #[error("frame {frame}: expected state {expected}, found {actual}")]
    InvalidFrameState {
        /// Frame index.
        frame: u64,
        /// The state the operation requires.
        expected: &'static str,
        /// The state the frame was in.
        actual: &'static str,
    },

    /// A bounded lock or completion wait elapsed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The previous draw did not finish in time.
    #[error("previous draw did not finish within {waited_ms} ms")]
    DrawTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A single allocation exceeds the capacity of one device buffer.
    #[error("allocation of {requested} {what} exceeds the per-buffer maximum of {maximum}")]
    AllocationTooLarge {
        /// "vertices" or "indices".
        what: &'static str,
        /// Requested element count.
        requested: usize,
        /// Largest element count one device buffer can hold.
        maximum: usize,
    },

    /// `flush` was called twice without an intervening `reset`.
    #[error("buffer generator was already flushed this frame")]
    AlreadyFlushed,

    /// An allocation or write arrived after the generator was flushed.
    #[error("buffer generator is flushed; {0} must happen before flush")]
    WriteAfterFlush(&'static str),

    /// Geometry was issued before its buffer generator was flushed.
    #[error("geometry for batch {0} has not been uploaded")]
    NotUploaded(String),

    /// A readback destination cannot hold the texture data.
    #[error("readback destination holds {actual} bytes, {required} required")]
    ReadbackTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The graphics device rejected an operation.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// A batch failed while being issued.
    #[error("failed to issue batch {batch}: {source}")]
    IssueFailed {
        /// Description of the batch.
        batch: String,
        /// The underlying failure.
        source: Box<RenderError>,
    },

    /// The preparation worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    /// The draw thread could not be started.
    #[error("failed to start draw thread: {0}")]
    DrawThread(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The coordinator has been shut down.
    #[error("render coordinator has been disposed")]
    CoordinatorDisposed,

    /// `begin_frame` was called while a frame is still being filled.
    #[error("a frame is already being prepared")]
    FrameInProgress,

    /// No frame is being filled.
    #[error("no frame is being prepared")]
    NoFrameInProgress,
}

impl RenderError {
    /// Wraps `self` as the cause of a failed issue.
    #[must_use]
    pub fn issue_failed(self, batch: String) -> Self {
        Self::IssueFailed {
            batch,
            source: Box::new(self),
        }
    }
}

/// Result type for rendering operations.
pub type RenderResult<T> = Result<T, RenderError>;
