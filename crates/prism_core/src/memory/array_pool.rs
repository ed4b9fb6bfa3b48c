//! # Array Pool
//!
//! Power-of-two sized arrays recycled across frames.
//!
//! Arrays are bucketed by size class. Released arrays are stamped with the
//! current generation and discarded by [`ArrayPool::step`] once they sit
//! unused for longer than the collection age.

use bytemuck::Zeroable;
use parking_lot::Mutex;

/// Smallest pooled size class (2^6 elements).
pub const MIN_POWER: u32 = 6;
/// Largest pooled size class (2^20 elements).
pub const MAX_POWER: u32 = 20;
/// Generations an unused array survives before it is dropped.
pub const COLLECTION_AGE: u64 = 2;

const BUCKET_COUNT: usize = (MAX_POWER - MIN_POWER + 1) as usize;

struct PooledArray<T> {
    data: Vec<T>,
    released_at: u64,
}

struct Buckets<T> {
    buckets: Vec<Vec<PooledArray<T>>>,
    generation: u64,
}

/// Counters describing an [`ArrayPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayPoolStats {
    /// Arrays currently pooled across all size classes.
    pub pooled: usize,
    /// Current generation.
    pub generation: u64,
}

/// A pool of zero-initialized arrays in power-of-two size classes.
///
/// # Example
///
/// ```rust,ignore
/// let pool: ArrayPool<u16> = ArrayPool::new(4);
///
/// let indices = pool.allocate(1000); // len == 1024
/// pool.release(indices);
/// pool.step();
/// ```
pub struct ArrayPool<T> {
    inner: Mutex<Buckets<T>>,
    per_bucket: usize,
}

impl<T: Zeroable + Copy> ArrayPool<T> {
    /// Creates a new array pool.
    ///
    /// # Arguments
    ///
    /// * `per_bucket` - Maximum number of arrays kept per size class
    #[must_use]
    pub fn new(per_bucket: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| Vec::new()).collect();
        Self {
            inner: Mutex::new(Buckets {
                buckets,
                generation: 0,
            }),
            per_bucket,
        }
    }

    /// Returns the size class an array of `len` elements is rounded up to.
    #[inline]
    #[must_use]
    pub fn size_class(len: usize) -> usize {
        len.max(1 << MIN_POWER).next_power_of_two()
    }

    fn bucket_index(len: usize) -> Option<usize> {
        if !len.is_power_of_two() {
            return None;
        }
        let power = len.trailing_zeros();
        if (MIN_POWER..=MAX_POWER).contains(&power) {
            Some((power - MIN_POWER) as usize)
        } else {
            None
        }
    }

    /// Allocates an array of at least `min_len` elements.
    ///
    /// The returned array's length is the power-of-two size class. Freshly
    /// built arrays are zeroed; recycled arrays keep their previous contents.
    pub fn allocate(&self, min_len: usize) -> Vec<T> {
        let len = Self::size_class(min_len);
        if let Some(index) = Self::bucket_index(len) {
            if let Some(pooled) = self.inner.lock().buckets[index].pop() {
                return pooled.data;
            }
        }
        vec![T::zeroed(); len]
    }

    /// Returns an array to the pool.
    ///
    /// Arrays whose length is not a pooled size class are dropped.
    pub fn release(&self, data: Vec<T>) {
        let Some(index) = Self::bucket_index(data.len()) else {
            return;
        };
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let bucket = &mut inner.buckets[index];
        if bucket.len() < self.per_bucket {
            bucket.push(PooledArray {
                data,
                released_at: generation,
            });
        }
    }

    /// Advances the generation and drops arrays unused for too long.
    pub fn step(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        for bucket in &mut inner.buckets {
            bucket.retain(|array| generation - array.released_at <= COLLECTION_AGE);
        }
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> ArrayPoolStats {
        let inner = self.inner.lock();
        ArrayPoolStats {
            pooled: inner.buckets.iter().map(Vec::len).sum(),
            generation: inner.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_rounding() {
        assert_eq!(ArrayPool::<u8>::size_class(0), 64);
        assert_eq!(ArrayPool::<u8>::size_class(64), 64);
        assert_eq!(ArrayPool::<u8>::size_class(65), 128);
        assert_eq!(ArrayPool::<u8>::size_class(1000), 1024);
    }

    #[test]
    fn test_array_reuse() {
        let pool: ArrayPool<u32> = ArrayPool::new(2);

        let mut array = pool.allocate(100);
        assert_eq!(array.len(), 128);
        array[0] = 42;
        pool.release(array);

        let array = pool.allocate(128);
        assert_eq!(array[0], 42);
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn test_step_collects_old_arrays() {
        let pool: ArrayPool<u16> = ArrayPool::new(4);
        pool.release(pool.allocate(64));

        pool.step();
        pool.step();
        assert_eq!(pool.stats().pooled, 1);

        pool.step();
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn test_odd_sizes_not_pooled() {
        let pool: ArrayPool<u8> = ArrayPool::new(4);
        pool.release(vec![0; 100]);
        pool.release(vec![0; 1 << 22]);
        assert_eq!(pool.stats().pooled, 0);
    }
}
