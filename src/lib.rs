//! # PRISM
//!
//! Frame preparation and buffer upload for a real-time renderer.
//!
//! ## Crates
//!
//! - [`core`]: object pools, per-frame slabs and the synchronization
//!   primitives shared by the preparation and draw threads
//! - [`render`]: batches, frames, the buffer generator and the render
//!   coordinator
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prism::render::{HeadlessDevice, RenderConfig, RenderCoordinator, RenderManager};
//!
//! let manager = RenderManager::new(RenderConfig::production(), Arc::new(HeadlessDevice::new()))?;
//! let coordinator = RenderCoordinator::new(manager)?;
//!
//! let frame = coordinator.begin_frame(Some("main"))?;
//! // ... add batches to the frame ...
//! coordinator.end_draw()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub use prism_core as core;
pub use prism_render as render;

pub use prism_render::{
    Frame, GraphicsDevice, RenderConfig, RenderCoordinator, RenderError, RenderManager,
    RenderResult,
};

/// Loads a [`RenderConfig`] from TOML and logs the resolved worker count.
///
/// # Errors
///
/// [`RenderError::InvalidConfig`] if the text does not parse or fails
/// validation.
pub fn load_config(text: &str) -> RenderResult<RenderConfig> {
    let config = RenderConfig::from_toml_str(text)?;
    tracing::info!(
        "loaded render config: {} prepare workers, threaded issue {}",
        config.prepare.resolved_worker_count(),
        config.coordinator.threaded_issue
    );
    Ok(config)
}
