//! # Growable Shared Arrays
//!
//! Backing storage written concurrently by preparation threads.
//!
//! ## Safety Note
//!
//! Writers mutate disjoint ranges of one array through a shared reference.
//! This module requires unsafe code for that; every unsafe block states the
//! invariant it relies on.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::Zeroable;
use parking_lot::{Mutex, RwLock};
use prism_core::ArrayPool;

/// A fixed-length array whose disjoint ranges may be written from many
/// threads at once.
pub(crate) struct SharedArray<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// SAFETY: access to the cells is coordinated by `GrowableArray`: every range
// is handed to exactly one writer, and whole-array reads only happen while
// the generator's write gate excludes writers.
unsafe impl<T: Send> Send for SharedArray<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for SharedArray<T> {}

impl<T> SharedArray<T> {
    fn from_vec(data: Vec<T>) -> Self {
        let boxed: Box<[T]> = data.into_boxed_slice();
        // SAFETY: `UnsafeCell<T>` is `repr(transparent)` over `T`, so the
        // slice layouts are identical.
        let cells = unsafe { Box::from_raw(Box::into_raw(boxed) as *mut [UnsafeCell<T>]) };
        Self { cells }
    }

    fn into_vec(self) -> Vec<T> {
        // SAFETY: inverse of `from_vec`.
        let boxed = unsafe { Box::from_raw(Box::into_raw(self.cells) as *mut [T]) };
        boxed.into_vec()
    }

    /// Number of elements.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns a mutable view of `start..start + len`.
    ///
    /// # Safety
    ///
    /// The caller must be the only party reading or writing this range for
    /// the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, start: usize, len: usize) -> &mut [T] {
        let cells = &self.cells[start..start + len];
        std::slice::from_raw_parts_mut(UnsafeCell::raw_get(cells.as_ptr()), len)
    }

    /// Returns a shared view of `start..start + len`.
    ///
    /// # Safety
    ///
    /// No writer may touch this range for the lifetime of the returned slice.
    pub(crate) unsafe fn slice(&self, start: usize, len: usize) -> &[T] {
        let cells = &self.cells[start..start + len];
        std::slice::from_raw_parts(UnsafeCell::raw_get(cells.as_ptr()).cast_const(), len)
    }
}

/// A scheduled copy of an outgrown array's reserved prefix into its successor.
struct PendingCopy<T> {
    from: Arc<SharedArray<T>>,
    to: Arc<SharedArray<T>>,
    count: usize,
}

/// A growable array with lock-free range reservation on the common path.
///
/// Reservations bump a shared counter with compare-and-swap while holding a
/// read lock on the current array, so a successful reservation always fits
/// the array it was made against. A reservation that does not fit takes the
/// write lock and grows the array to the next power of two. Growth never
/// touches the old array: callers may still be writing into it, so the
/// copy-forward of its reserved prefix is queued and runs at flush time.
pub(crate) struct GrowableArray<T> {
    current: RwLock<Arc<SharedArray<T>>>,
    reserved: AtomicUsize,
    pending: Mutex<Vec<PendingCopy<T>>>,
    pool: ArrayPool<T>,
    growths: AtomicU64,
    label: &'static str,
}

impl<T: Zeroable + Copy + Send + Sync> GrowableArray<T> {
    pub(crate) fn new(label: &'static str, initial_capacity: usize, per_size_class: usize) -> Self {
        let pool = ArrayPool::new(per_size_class);
        let initial = pool.allocate(initial_capacity);
        Self {
            current: RwLock::new(Arc::new(SharedArray::from_vec(initial))),
            reserved: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
            pool,
            growths: AtomicU64::new(0),
            label,
        }
    }

    /// Elements reserved since the last reset.
    #[inline]
    pub(crate) fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Capacity of the current array.
    pub(crate) fn capacity(&self) -> usize {
        self.current.read().len()
    }

    /// Growths performed since construction.
    pub(crate) fn growths(&self) -> u64 {
        self.growths.load(Ordering::Relaxed)
    }

    /// Copy-forwards queued for the next flush.
    pub(crate) fn pending_copies(&self) -> usize {
        self.pending.lock().len()
    }

    /// The array every reserved range ends up in after flush.
    pub(crate) fn current(&self) -> Arc<SharedArray<T>> {
        Arc::clone(&self.current.read())
    }

    /// Reserves `count` elements.
    ///
    /// # Returns
    ///
    /// The array the caller must write into and the start of its range.
    pub(crate) fn reserve(&self, count: usize) -> (Arc<SharedArray<T>>, usize) {
        loop {
            {
                let current = self.current.read();
                let start = self.reserved.load(Ordering::Acquire);
                let end = start + count;
                if end <= current.len() {
                    if self
                        .reserved
                        .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return (Arc::clone(&current), start);
                    }
                    continue;
                }
            }
            self.grow(count);
        }
    }

    fn grow(&self, count: usize) {
        let mut current = self.current.write();
        let reserved = self.reserved.load(Ordering::Acquire);
        let needed = reserved + count;
        if needed <= current.len() {
            return;
        }

        let next = Arc::new(SharedArray::from_vec(self.pool.allocate(needed)));
        let previous = std::mem::replace(&mut *current, Arc::clone(&next));
        tracing::debug!(
            "{} array grew {} -> {} ({} reserved, copy deferred)",
            self.label,
            previous.len(),
            next.len(),
            reserved
        );
        self.pending.lock().push(PendingCopy {
            from: previous,
            to: next,
            count: reserved,
        });
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs every queued copy-forward in growth order.
    ///
    /// # Safety
    ///
    /// No reservation holder may be writing while this runs.
    pub(crate) unsafe fn apply_copies(&self) {
        let copies = std::mem::take(&mut *self.pending.lock());
        for copy in copies {
            let source = copy.from.slice(0, copy.count);
            copy.to.slice_mut(0, copy.count).copy_from_slice(source);
            self.recycle(copy.from);
        }
    }

    /// Forgets every reservation and advances the array pool generation.
    ///
    /// Must only run while no reservation holder is writing.
    pub(crate) fn reset(&self) {
        let copies = std::mem::take(&mut *self.pending.lock());
        for copy in copies {
            self.recycle(copy.from);
        }
        self.reserved.store(0, Ordering::Release);
        self.pool.step();
    }

    fn recycle(&self, array: Arc<SharedArray<T>>) {
        if let Ok(array) = Arc::try_unwrap(array) {
            self.pool.release(array.into_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reserve_within_capacity() {
        let array: GrowableArray<u32> = GrowableArray::new("test", 64, 2);
        let (first, a) = array.reserve(10);
        let (second, b) = array.reserve(20);

        assert_eq!((a, b), (0, 10));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(array.reserved(), 30);
        assert_eq!(array.growths(), 0);
    }

    #[test]
    fn test_growth_defers_copy() {
        let array: GrowableArray<u32> = GrowableArray::new("test", 64, 2);
        let (old, start) = array.reserve(60);
        // SAFETY: the range was reserved by this test alone.
        unsafe { old.slice_mut(start, 60) }.fill(7);

        let (new, next) = array.reserve(10);
        assert_eq!(next, 60);
        assert_eq!(array.capacity(), 128);
        assert_eq!(array.growths(), 1);
        assert_eq!(array.pending_copies(), 1);
        assert!(!Arc::ptr_eq(&old, &new));

        // Late write into the outgrown array must survive the copy.
        // SAFETY: same exclusive range as above.
        (unsafe { old.slice_mut(59, 1) })[0] = 9;
        // SAFETY: no writers remain.
        unsafe { array.apply_copies() };

        let current = array.current();
        // SAFETY: no writers remain.
        let data = unsafe { current.slice(0, 60) };
        assert!(data[..59].iter().all(|&v| v == 7));
        assert_eq!(data[59], 9);
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        let array = Arc::new(GrowableArray::<u64>::new("test", 64, 2));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let array = Arc::clone(&array);
                thread::spawn(move || {
                    let mut ranges = Vec::new();
                    for i in 0..200 {
                        let count = 1 + (t + i) % 7;
                        let (target, start) = array.reserve(count);
                        // SAFETY: each reservation is exclusive to this thread.
                        unsafe { target.slice_mut(start, count) }.fill((start as u64) << 8 | count as u64);
                        ranges.push((start, count));
                    }
                    ranges
                })
            })
            .collect();

        let mut ranges: Vec<(usize, usize)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }

        // SAFETY: all writers joined.
        unsafe { array.apply_copies() };
        let current = array.current();
        for (start, count) in ranges {
            // SAFETY: all writers joined.
            let data = unsafe { current.slice(start, count) };
            let expected = (start as u64) << 8 | count as u64;
            assert!(data.iter().all(|&v| v == expected));
        }
    }

    #[test]
    fn test_reset_clears_reservations() {
        let array: GrowableArray<u16> = GrowableArray::new("test", 64, 2);
        let _ = array.reserve(100);
        let generation = array.pool.stats().generation;
        array.reset();
        assert_eq!(array.pool.stats().generation, generation + 1);
        assert_eq!(array.reserved(), 0);
        assert_eq!(array.pending_copies(), 0);
        let (_, start) = array.reserve(1);
        assert_eq!(start, 0);
    }
}
