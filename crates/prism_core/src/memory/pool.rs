//! # Object Pool
//!
//! Capacity-bounded free-list for objects that are recycled every frame.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Default number of pooled instances kept per pool.
pub const DEFAULT_POOL_CAPACITY: usize = 512;

/// A thread-safe, capacity-bounded pool of reusable objects.
///
/// `allocate` pops a pooled instance if one is available and otherwise builds
/// a new one with the pool's constructor. `release` pushes the instance back
/// unless the pool is already full, in which case the instance is dropped.
///
/// # Thread Safety
///
/// All operations take `&self`. The free-list is guarded by a single short
/// lock, so the pool can be shared behind an `Arc` by every producer thread.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ObjectPool::new(16, || Vec::<u8>::with_capacity(1024));
///
/// let buffer = pool.allocate();
/// pool.release(buffer);
/// assert_eq!(pool.pooled_count(), 1);
/// ```
pub struct ObjectPool<T> {
    /// Pooled instances.
    free: Mutex<Vec<T>>,
    /// Maximum number of pooled instances.
    capacity: AtomicUsize,
    /// Constructor for fresh instances.
    factory: Box<dyn Fn() -> T + Send + Sync>,
    /// Instances built by the constructor.
    created: AtomicU64,
    /// Allocations served from the free-list.
    reused: AtomicU64,
    /// Releases dropped because the pool was full.
    dropped: AtomicU64,
}

/// Counters describing how a pool has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances built by the constructor.
    pub created: u64,
    /// Allocations served from the free-list.
    pub reused: u64,
    /// Releases dropped because the pool was full.
    pub dropped: u64,
    /// Instances currently pooled.
    pub pooled: usize,
}

impl<T> ObjectPool<T> {
    /// Creates a new pool.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of pooled instances
    /// * `factory` - Builds a fresh instance when the pool is empty
    #[must_use]
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(DEFAULT_POOL_CAPACITY))),
            capacity: AtomicUsize::new(capacity),
            factory: Box::new(factory),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns the maximum number of pooled instances.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Returns the number of instances currently pooled.
    #[inline]
    #[must_use]
    pub fn pooled_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Changes the capacity, dropping pooled instances above the new limit.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() > capacity {
            let excess = free.len() - capacity;
            free.truncate(capacity);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
        }
    }

    /// Takes an instance out of the pool, building one if the pool is empty.
    pub fn allocate(&self) -> T {
        let pooled = self.free.lock().pop();
        if let Some(value) = pooled {
            self.reused.fetch_add(1, Ordering::Relaxed);
            value
        } else {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        }
    }

    /// Returns an instance to the pool.
    ///
    /// # Returns
    ///
    /// `true` if the instance was pooled, `false` if the pool was full and
    /// the instance was dropped.
    pub fn release(&self, value: T) -> bool {
        let mut free = self.free.lock();
        if free.len() >= self.capacity() {
            drop(free);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            // `value` drops here, outside the lock.
            drop(value);
            return false;
        }
        free.push(value);
        true
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pooled: self.pooled_count(),
        }
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pool_reuses_released_instances() {
        let pool = ObjectPool::new(4, || Vec::<u32>::with_capacity(8));

        let mut list = pool.allocate();
        list.push(7);
        assert!(pool.release(list));

        let list = pool.allocate();
        assert_eq!(list, vec![7]);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn test_pool_drops_excess_instances() {
        let pool = ObjectPool::new(2, || 0u64);

        assert!(pool.release(1));
        assert!(pool.release(2));
        assert!(!pool.release(3));

        assert_eq!(pool.pooled_count(), 2);
        assert_eq!(pool.stats().dropped, 1);
    }

    #[test]
    fn test_pool_set_capacity_trims() {
        let pool = ObjectPool::new(8, || 0u8);
        for i in 0..8 {
            pool.release(i);
        }

        pool.set_capacity(3);
        assert_eq!(pool.pooled_count(), 3);
        assert_eq!(pool.capacity(), 3);
        assert!(!pool.release(9));
    }

    #[test]
    fn test_pool_concurrent_allocate_release() {
        let pool = Arc::new(ObjectPool::new(64, || Box::new([0u8; 32])));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let value = pool.allocate();
                        pool.release(value);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert!(stats.created <= 4);
        assert!(stats.pooled <= 64);
    }
}
