//! # Render Configuration
//!
//! Runtime-tunable knobs for pools, preparation, combining, buffer
//! generation and the coordinator. Loaded once at startup, typically from
//! a TOML file:
//!
//! ```toml
//! [prepare]
//! worker_count = 4
//! prepare_lock_timeout_ms = 5000
//!
//! [buffers]
//! max_software_buffers_per_hardware_buffer = 64
//! ```
//!
//! Every field has a default, so a partial file is valid.

use std::time::Duration;

use prism_core::ListPoolConfig;
use serde::Deserialize;

use crate::error::{RenderError, RenderResult};

/// Largest vertex count addressable by a 16-bit index buffer.
pub const MAX_U16_VERTICES: usize = 65_535;

/// Pool capacities and list-pool thresholds.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooled instances kept per batch kind.
    pub batch_pool_capacity: usize,
    /// Pooled frames kept.
    pub frame_pool_capacity: usize,
    /// Maximum pooled small lists.
    pub list_small_pool_capacity: usize,
    /// Maximum pooled large lists.
    pub list_large_pool_capacity: usize,
    /// Capacity of freshly built lists.
    pub list_initial_capacity: usize,
    /// Largest list capacity routed to the small pool.
    pub list_small_max_item_size: usize,
    /// Largest list capacity kept at all.
    pub list_large_max_item_size: usize,
    /// Lists longer than this are cleared on the background worker.
    pub list_clear_threshold: usize,
    /// Arrays kept per size class in the backing-array pools.
    pub arrays_per_size_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            batch_pool_capacity: 512,
            frame_pool_capacity: 8,
            list_small_pool_capacity: 256,
            list_large_pool_capacity: 4,
            list_initial_capacity: 64,
            list_small_max_item_size: 512,
            list_large_max_item_size: 10_240,
            list_clear_threshold: 512,
            arrays_per_size_class: 4,
        }
    }
}

impl PoolConfig {
    /// Returns the list-pool settings.
    #[must_use]
    pub fn list_pool(&self) -> ListPoolConfig {
        ListPoolConfig {
            small_pool_capacity: self.list_small_pool_capacity,
            large_pool_capacity: self.list_large_pool_capacity,
            initial_item_capacity: self.list_initial_capacity,
            small_max_item_size: self.list_small_max_item_size,
            large_max_item_size: self.list_large_max_item_size,
            clear_threshold: self.list_clear_threshold,
        }
    }
}

/// Preparation settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrepareConfig {
    /// Worker threads for parallel preparation. 0 picks
    /// `clamp(available_parallelism, 2, 8)`.
    pub worker_count: usize,
    /// Bounded wait on the global preparation lock.
    pub prepare_lock_timeout_ms: u64,
    /// Bounded wait on a suspended batch.
    pub suspend_timeout_ms: u64,
    /// Whether frames are prepared across the worker pool.
    pub threaded: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            prepare_lock_timeout_ms: 5000,
            suspend_timeout_ms: 1000,
            threaded: true,
        }
    }
}

impl PrepareConfig {
    /// Resolves the worker count.
    #[must_use]
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map_or(2, std::num::NonZeroUsize::get)
            .clamp(2, 8)
    }

    /// Global preparation lock timeout.
    #[must_use]
    pub const fn prepare_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_lock_timeout_ms)
    }

    /// Suspended batch timeout.
    #[must_use]
    pub const fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }
}

/// Batch combining settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CombineConfig {
    /// Whether adjacent compatible batches are merged.
    pub enabled: bool,
    /// A merge is refused once the combined item count would exceed this.
    pub max_item_count: usize,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_item_count: 1024,
        }
    }
}

/// Buffer generator settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    /// Vertices one device buffer can hold.
    pub max_vertices_per_buffer: usize,
    /// Indices one device buffer can hold.
    pub max_indices_per_buffer: usize,
    /// Software buffers that may share one device buffer.
    pub max_software_buffers_per_hardware_buffer: usize,
    /// Frames an unused device buffer survives.
    pub max_buffer_age: u32,
    /// Unused device buffers kept for reuse.
    pub max_unused_buffers: usize,
    /// Initial backing array capacity, in elements.
    pub initial_array_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_vertices_per_buffer: MAX_U16_VERTICES,
            max_indices_per_buffer: MAX_U16_VERTICES * 3,
            max_software_buffers_per_hardware_buffer: 128,
            max_buffer_age: 30,
            max_unused_buffers: 16,
            initial_array_capacity: 1024,
        }
    }
}

/// Render coordinator settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Whether issuance runs on a dedicated draw thread.
    pub threaded_issue: bool,
    /// Bounded wait on the previous draw.
    pub draw_wait_timeout_ms: u64,
    /// Draws are skipped for this long after a device reset.
    pub device_settle_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            threaded_issue: true,
            draw_wait_timeout_ms: 5000,
            device_settle_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    /// Previous-draw wait timeout.
    #[must_use]
    pub const fn draw_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.draw_wait_timeout_ms)
    }

    /// Settle window after a device reset.
    #[must_use]
    pub const fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }
}

/// Complete configuration for one rendering context.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenderConfig {
    /// Pool capacities.
    pub pools: PoolConfig,
    /// Preparation.
    pub prepare: PrepareConfig,
    /// Combining.
    pub combine: CombineConfig,
    /// Buffer generation.
    pub buffers: BufferConfig,
    /// Coordinator.
    pub coordinator: CoordinatorConfig,
}

impl RenderConfig {
    /// Everything on the caller's thread. Useful for tests and tools.
    #[must_use]
    pub fn single_threaded() -> Self {
        Self {
            prepare: PrepareConfig {
                worker_count: 1,
                threaded: false,
                ..PrepareConfig::default()
            },
            coordinator: CoordinatorConfig {
                threaded_issue: false,
                ..CoordinatorConfig::default()
            },
            ..Self::default()
        }
    }

    /// Full pipeline: parallel preparation and a dedicated draw thread.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidConfig`] if the document does not parse
    /// or fails validation.
    pub fn from_toml_str(source: &str) -> RenderResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| RenderError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> RenderResult<()> {
        let buffers = &self.buffers;
        if buffers.max_vertices_per_buffer == 0 || buffers.max_indices_per_buffer == 0 {
            return Err(RenderError::InvalidConfig(
                "buffers.max_vertices_per_buffer and max_indices_per_buffer must be non-zero".into(),
            ));
        }
        if buffers.max_vertices_per_buffer > MAX_U16_VERTICES {
            return Err(RenderError::InvalidConfig(format!(
                "buffers.max_vertices_per_buffer is limited to {MAX_U16_VERTICES} by 16-bit indices"
            )));
        }
        if buffers.max_software_buffers_per_hardware_buffer == 0 {
            return Err(RenderError::InvalidConfig(
                "buffers.max_software_buffers_per_hardware_buffer must be non-zero".into(),
            ));
        }
        if self.pools.list_small_max_item_size > self.pools.list_large_max_item_size {
            return Err(RenderError::InvalidConfig(
                "pools.list_small_max_item_size exceeds list_large_max_item_size".into(),
            ));
        }
        if self.prepare.prepare_lock_timeout_ms == 0 || self.coordinator.draw_wait_timeout_ms == 0 {
            return Err(RenderError::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
