//! Per-kind batch pools.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use prism_core::{ListPool, ObjectPool, PoolStats};

use super::{Batch, BatchKind, BatchRef, QuadItem};

/// List pools shared by every batch pool.
#[derive(Clone)]
pub(crate) struct PayloadLists {
    pub(crate) quads: Arc<ListPool<QuadItem>>,
    pub(crate) children: Arc<ListPool<BatchRef>>,
}

/// Capacity-bounded pool of batches of one kind.
///
/// Pooled batches are released and uninitialized. Each batch keeps a weak
/// reference back to its pool so `release_resources` can return it.
pub struct BatchPool {
    kind: BatchKind,
    instances: ObjectPool<BatchRef>,
    lists: PayloadLists,
}

impl BatchPool {
    pub(crate) fn new(
        kind: BatchKind,
        capacity: usize,
        sequence: Arc<AtomicU64>,
        lists: PayloadLists,
    ) -> Arc<Self> {
        Arc::new_cyclic(|pool| {
            let pool = pool.clone();
            Self {
                kind,
                instances: ObjectPool::new(capacity, move || {
                    Arc::new(Batch::new_pooled(kind, Arc::clone(&sequence), pool.clone()))
                }),
                lists,
            }
        })
    }

    /// Kind of batch this pool holds.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Maximum number of pooled batches.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.instances.capacity()
    }

    /// Changes the capacity, dropping pooled batches above it.
    pub fn set_capacity(&self, capacity: usize) {
        self.instances.set_capacity(capacity);
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.instances.stats()
    }

    pub(crate) fn lists(&self) -> &PayloadLists {
        &self.lists
    }

    pub(crate) fn allocate(&self) -> BatchRef {
        let batch = self.instances.allocate();
        batch.attach_lists(&self.lists);
        batch
    }

    pub(crate) fn recycle(&self, batch: BatchRef) {
        if !self.instances.release(batch) {
            tracing::trace!("{} pool full, dropping released batch", self.kind.name());
        }
    }
}

impl std::fmt::Debug for BatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPool")
            .field("kind", &self.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::ListPoolConfig;

    fn pool(capacity: usize) -> Arc<BatchPool> {
        let lists = PayloadLists {
            quads: Arc::new(ListPool::new(ListPoolConfig::default())),
            children: Arc::new(ListPool::new(ListPoolConfig::default())),
        };
        BatchPool::new(BatchKind::Geometry, capacity, Arc::new(AtomicU64::new(0)), lists)
    }

    #[test]
    fn test_released_batch_returns_to_pool() {
        let pool = pool(4);
        let batch = pool.allocate();
        batch.initialize(None, 0, None).unwrap();
        batch.dispose().unwrap();
        assert_eq!(batch.release_resources(), Ok(true));

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.pooled, 1);

        let again = pool.allocate();
        assert!(Arc::ptr_eq(&batch, &again));
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_full_pool_drops_batches() {
        let pool = pool(1);
        let batches: Vec<_> = (0..3).map(|_| pool.allocate()).collect();
        for batch in &batches {
            batch.initialize(None, 0, None).unwrap();
            batch.dispose().unwrap();
            batch.release_resources().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.pooled, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_shrinking_capacity_drops_excess() {
        let pool = pool(8);
        let batches: Vec<_> = (0..4).map(|_| pool.allocate()).collect();
        for batch in &batches {
            batch.initialize(None, 0, None).unwrap();
            batch.dispose().unwrap();
            batch.release_resources().unwrap();
        }
        pool.set_capacity(2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.stats().pooled, 2);
    }
}
