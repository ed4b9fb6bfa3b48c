//! # Batch Combining
//!
//! Greedy single-pass merge of adjacent compatible batches, run before a
//! container prepares its batches.
//!
//! Batches are first sorted into issue order (layer, material, creation
//! index). Each run of mergeable neighbours then folds into its first batch,
//! so merging never moves work across a batch it did not absorb. Absorbed
//! batches are marked combined and moved out of the list; they are never
//! issued but are still released with their container.

use std::sync::Arc;

use crate::batch::{Batch, BatchKind, BatchRef};
use crate::error::RenderResult;

/// Decides whether two batches can merge, and merges them.
pub trait BatchCombiner: Send + Sync {
    /// Returns true if `b` may be merged into `a`.
    fn can_combine(&self, a: &Batch, b: &Batch) -> bool;

    /// Moves `b`'s draw data into `a` and marks `b` combined.
    ///
    /// # Errors
    ///
    /// Returns an error if the batches cannot be merged after all.
    fn combine(&self, a: &Batch, b: &Batch) -> RenderResult<()>;
}

/// Merges geometry batches that share layer, material and render states.
#[derive(Debug, Clone, Copy)]
pub struct GeometryCombiner {
    max_item_count: usize,
}

impl GeometryCombiner {
    /// Creates a combiner that never builds a batch larger than
    /// `max_item_count` quads.
    #[must_use]
    pub const fn new(max_item_count: usize) -> Self {
        Self { max_item_count }
    }

    /// Largest merged batch, in quads.
    #[must_use]
    pub const fn max_item_count(&self) -> usize {
        self.max_item_count
    }
}

impl BatchCombiner for GeometryCombiner {
    fn can_combine(&self, a: &Batch, b: &Batch) -> bool {
        a.kind() == BatchKind::Geometry
            && b.kind() == BatchKind::Geometry
            && a.is_combinable()
            && b.is_combinable()
            && a.layer() == b.layer()
            && a.material() == b.material()
            && a.render_states() == b.render_states()
            && a.item_count() + b.item_count() <= self.max_item_count
    }

    fn combine(&self, a: &Batch, b: &Batch) -> RenderResult<()> {
        a.absorb(b)
    }
}

/// Sorts batches into issue order, then combines adjacent ones.
///
/// Absorbed batches are appended to `combined`.
///
/// # Returns
///
/// Number of batches absorbed.
pub fn combine_batches(
    batches: &mut Vec<BatchRef>,
    combiners: &[Box<dyn BatchCombiner>],
    combined: &mut Vec<BatchRef>,
) -> usize {
    sort_batches(batches);
    if combiners.is_empty() || batches.len() < 2 {
        return 0;
    }

    let before = combined.len();
    let mut survivors = Vec::with_capacity(batches.len());
    let mut target: Option<BatchRef> = None;
    for batch in batches.drain(..) {
        if let Some(current) = &target {
            let merged = combiners
                .iter()
                .find(|c| c.can_combine(current, &batch))
                .map(|c| c.combine(current, &batch));
            match merged {
                Some(Ok(())) => {
                    combined.push(batch);
                    continue;
                }
                Some(Err(error)) => {
                    tracing::warn!("combining {} into {} failed: {}", batch, current, error);
                }
                None => {}
            }
        }
        target = Some(Arc::clone(&batch));
        survivors.push(batch);
    }
    *batches = survivors;

    let absorbed = combined.len() - before;
    if absorbed > 0 {
        tracing::trace!("combined {} batches, {} remain", absorbed, batches.len());
    }
    absorbed
}

/// Sorts batches by layer, material and creation index.
pub fn sort_batches(batches: &mut [BatchRef]) {
    batches.sort_by_cached_key(|batch| batch.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::QuadItem;
    use crate::config::RenderConfig;
    use crate::device::{BlendMode, HeadlessDevice, MaterialId, RenderStates, TextureId};
    use crate::manager::RenderManager;

    fn manager() -> Arc<RenderManager> {
        RenderManager::new(RenderConfig::single_threaded(), Arc::new(HeadlessDevice::new())).unwrap()
    }

    fn geometry(manager: &RenderManager, layer: i32, quads: usize) -> BatchRef {
        let batch = manager
            .new_geometry(None, layer, None, RenderStates::default())
            .unwrap();
        batch
            .add_quads((0..quads).map(|i| {
                QuadItem::rect(Some(TextureId(1)), [i as f32, 0.0], [1.0, 1.0], 0.0, [255; 4])
            }))
            .unwrap();
        batch.dispose().unwrap();
        batch
    }

    fn combiners(max: usize) -> Vec<Box<dyn BatchCombiner>> {
        vec![Box::new(GeometryCombiner::new(max))]
    }

    #[test]
    fn test_adjacent_compatible_batches_merge() {
        let manager = manager();
        let a = geometry(&manager, 0, 3);
        let b = geometry(&manager, 0, 3);
        let mut batches = vec![Arc::clone(&a), Arc::clone(&b)];
        let mut combined = Vec::new();

        let absorbed = combine_batches(&mut batches, &combiners(64), &mut combined);

        assert_eq!(absorbed, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(a.item_count(), 6);
        assert!(b.is_combined());
        assert_eq!(b.item_count(), 0);
        assert!(Arc::ptr_eq(&combined[0], &b));
    }

    #[test]
    fn test_threshold_blocks_merge() {
        let manager = manager();
        let mut batches = vec![geometry(&manager, 0, 40), geometry(&manager, 0, 40)];
        let mut combined = Vec::new();

        assert_eq!(combine_batches(&mut batches, &combiners(64), &mut combined), 0);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_incompatible_states_do_not_merge() {
        let manager = manager();
        let a = geometry(&manager, 0, 1);
        let b = geometry(&manager, 0, 1);
        b.set_render_states(RenderStates {
            blend: BlendMode::Additive,
            ..RenderStates::default()
        })
        .unwrap();
        let c = manager
            .new_geometry(None, 0, Some(MaterialId(2)), RenderStates::default())
            .unwrap();
        c.dispose().unwrap();

        let mut batches = vec![a, b, c];
        let mut combined = Vec::new();
        assert_eq!(combine_batches(&mut batches, &combiners(64), &mut combined), 0);
    }

    #[test]
    fn test_batches_kept_for_reuse_never_merge() {
        let manager = manager();
        let kept = manager
            .new_geometry(None, 0, None, RenderStates::default())
            .unwrap();
        let handed_off = geometry(&manager, 0, 1);

        let mut batches = vec![kept, handed_off];
        let mut combined = Vec::new();
        assert_eq!(combine_batches(&mut batches, &combiners(64), &mut combined), 0);
    }

    #[test]
    fn test_result_is_sorted_by_layer() {
        let manager = manager();
        let mut batches = vec![
            geometry(&manager, 3, 1),
            geometry(&manager, 1, 1),
            geometry(&manager, 2, 1),
        ];
        let mut combined = Vec::new();
        combine_batches(&mut batches, &[], &mut combined);

        let layers: Vec<_> = batches.iter().map(|b| b.layer()).collect();
        assert_eq!(layers, vec![1, 2, 3]);
    }
}
