//! # Frame Slabs
//!
//! Per-frame scratch memory keyed by element type.
//!
//! Each element type gets a list of fixed-capacity slabs. Allocations are
//! appended to the last slab with room (bump style) and the whole set is
//! reset in bulk when the frame is disposed. Slabs keep their capacity
//! across resets, so a steady-state frame allocates nothing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

use parking_lot::Mutex;

/// Ideal slab size in bytes.
pub const IDEAL_SLAB_BYTES: usize = 1024 * 1024;
/// Minimum slab size in elements.
pub const MIN_SLAB_ITEMS: usize = 256;

/// Handle to a contiguous run of elements inside a [`SlabSet`].
#[derive(Debug)]
pub struct SlabSpan<T> {
    slab: usize,
    start: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SlabSpan<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlabSpan<T> {}

impl<T> SlabSpan<T> {
    /// Number of elements in the span.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the span holds no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct TypedSlabs<T> {
    slabs: Vec<Vec<T>>,
    /// Index of the slab currently being filled.
    current: usize,
}

impl<T: Copy> TypedSlabs<T> {
    fn new() -> Self {
        Self {
            slabs: Vec::new(),
            current: 0,
        }
    }

    fn ideal_items() -> usize {
        (IDEAL_SLAB_BYTES / std::mem::size_of::<T>().max(1)).max(MIN_SLAB_ITEMS)
    }

    fn push(&mut self, items: &[T]) -> (usize, usize) {
        while self.current < self.slabs.len() {
            let slab = &mut self.slabs[self.current];
            if slab.capacity() - slab.len() >= items.len() {
                let start = slab.len();
                slab.extend_from_slice(items);
                return (self.current, start);
            }
            self.current += 1;
        }

        let mut slab = Vec::with_capacity(Self::ideal_items().max(items.len()));
        slab.extend_from_slice(items);
        self.slabs.push(slab);
        self.current = self.slabs.len() - 1;
        (self.current, 0)
    }

    fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.clear();
        }
        self.current = 0;
    }
}

/// A set of per-type slabs owned by one frame.
///
/// # Example
///
/// ```rust,ignore
/// let slabs = SlabSet::new();
/// let span = slabs.allocate(&[1.0f32, 2.0, 3.0]);
/// let sum = slabs.with(span, |values| values.iter().sum::<f32>());
/// slabs.reset();
/// ```
#[derive(Default)]
pub struct SlabSet {
    slabs: Mutex<HashMap<TypeId, Box<dyn ErasedSlabs>>>,
    /// Resets performed, used to detect stale spans.
    epoch: Mutex<u64>,
}

impl SlabSet {
    /// Creates an empty slab set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `items` into the slab for `T` and returns a span describing them.
    pub fn allocate<T: Copy + Send + 'static>(&self, items: &[T]) -> SlabSpan<T> {
        let mut slabs = self.slabs.lock();
        let entry = slabs
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(TypedSlabs::<T>::new()));
        let (slab, start) = match entry.as_any_mut().downcast_mut::<TypedSlabs<T>>() {
            Some(typed) => typed.push(items),
            None => unreachable!("slab entries are keyed by their element type"),
        };
        SlabSpan {
            slab,
            start,
            len: items.len(),
            _marker: PhantomData,
        }
    }

    /// Runs `f` over the elements of `span`.
    ///
    /// # Returns
    ///
    /// `None` if the span no longer refers to live data.
    pub fn with<T: Copy + Send + 'static, R>(
        &self,
        span: SlabSpan<T>,
        f: impl FnOnce(&[T]) -> R,
    ) -> Option<R> {
        let slabs = self.slabs.lock();
        let typed = slabs
            .get(&TypeId::of::<T>())?
            .as_any()
            .downcast_ref::<TypedSlabs<T>>()?;
        let slab = typed.slabs.get(span.slab)?;
        let items = slab.get(span.start..span.start + span.len)?;
        Some(f(items))
    }

    /// Runs `f` over the elements of `span` with mutable access.
    pub fn with_mut<T: Copy + Send + 'static, R>(
        &self,
        span: SlabSpan<T>,
        f: impl FnOnce(&mut [T]) -> R,
    ) -> Option<R> {
        let mut slabs = self.slabs.lock();
        let typed = slabs
            .get_mut(&TypeId::of::<T>())?
            .as_any_mut()
            .downcast_mut::<TypedSlabs<T>>()?;
        let slab = typed.slabs.get_mut(span.slab)?;
        let items = slab.get_mut(span.start..span.start + span.len)?;
        Some(f(items))
    }

    /// Number of element types with at least one slab.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.slabs.lock().len()
    }

    /// Number of resets performed so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Clears every slab, keeping their capacity for the next frame.
    ///
    /// Spans handed out before the reset must not be used afterwards.
    pub fn reset(&self) {
        let mut slabs = self.slabs.lock();
        for entry in slabs.values_mut() {
            entry.reset();
        }
        *self.epoch.lock() += 1;
    }
}

/// Type-erased view of one element type's slabs.
trait ErasedSlabs: Send {
    fn reset(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Copy + Send + 'static> ErasedSlabs for TypedSlabs<T> {
    fn reset(&mut self) {
        TypedSlabs::reset(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl std::fmt::Debug for SlabSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabSet")
            .field("types", &self.type_count())
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_allocate_and_read() {
        let slabs = SlabSet::new();
        let a = slabs.allocate(&[1u32, 2, 3]);
        let b = slabs.allocate(&[4u32, 5]);

        assert_eq!(slabs.with(a, <[u32]>::to_vec), Some(vec![1, 2, 3]));
        assert_eq!(slabs.with(b, <[u32]>::to_vec), Some(vec![4, 5]));
        assert_eq!(slabs.type_count(), 1);
    }

    #[test]
    fn test_slab_types_are_separate() {
        let slabs = SlabSet::new();
        let ints = slabs.allocate(&[7u16; 4]);
        let floats = slabs.allocate(&[0.5f32; 2]);

        assert_eq!(slabs.type_count(), 2);
        assert_eq!(slabs.with(ints, |v| v.len()), Some(4));
        assert_eq!(slabs.with(floats, |v| v[1]), Some(0.5));
    }

    #[test]
    fn test_slab_oversized_allocation_gets_own_slab() {
        let slabs = SlabSet::new();
        let big = vec![1u8; IDEAL_SLAB_BYTES + 10];
        let span = slabs.allocate(&big);
        assert_eq!(span.len(), IDEAL_SLAB_BYTES + 10);
        assert_eq!(slabs.with(span, |v| v.len()), Some(IDEAL_SLAB_BYTES + 10));
    }

    #[test]
    fn test_slab_reset_invalidates_spans() {
        let slabs = SlabSet::new();
        let span = slabs.allocate(&[9u64; 8]);

        slabs.with_mut(span, |values| values[0] = 1);
        assert_eq!(slabs.with(span, |v| v[0]), Some(1));

        slabs.reset();
        assert_eq!(slabs.epoch(), 1);
        assert_eq!(slabs.with(span, |v| v[0]), None);
    }
}
