//! Frame and buffer statistics.

/// Statistics from one prepared and drawn frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Batches added to the frame.
    pub batches: u32,
    /// Batches absorbed by combining.
    pub combined: u32,
    /// Batches prepared.
    pub prepared: u32,
    /// Batches issued.
    pub issued: u32,
    /// Indexed draw calls sent to the device.
    pub draw_calls: u32,
}

impl FrameStats {
    /// Fraction of the added batches that combining removed.
    #[must_use]
    pub fn combine_ratio(&self) -> f32 {
        if self.batches > 0 {
            self.combined as f32 / self.batches as f32
        } else {
            0.0
        }
    }

    /// Returns true if draw calls are under `budget`.
    #[must_use]
    pub const fn draw_calls_within(&self, budget: u32) -> bool {
        self.draw_calls <= budget
    }
}

/// Snapshot of a buffer generator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Allocations since construction.
    pub allocations: u64,
    /// Vertices reserved this frame.
    pub vertices_reserved: usize,
    /// Indices reserved this frame.
    pub indices_reserved: usize,
    /// Capacity of the current vertex array.
    pub vertex_capacity: usize,
    /// Capacity of the current index array.
    pub index_capacity: usize,
    /// Array growths since construction.
    pub growths: u64,
    /// Vertex array growths since construction.
    pub vertex_growths: u64,
    /// Index array growths since construction.
    pub index_growths: u64,
    /// Copy-forwards waiting for the next flush.
    pub pending_copies: usize,
    /// Hardware entries in use this frame.
    pub used_entries: usize,
    /// Idle device buffer pairs.
    pub available_buffers: usize,
    /// Device buffer pairs destroyed at the next flush.
    pub expiring_buffers: usize,
    /// Registered cached buffers.
    pub cached_buffers: usize,
    /// Flushes since construction.
    pub flushes: u64,
}
