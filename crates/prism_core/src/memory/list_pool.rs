//! # List Pool
//!
//! Two-tier pool of growable lists with background clearing.
//!
//! Small lists are cleared inline on release. Lists longer than the clear
//! threshold are handed to a worker thread so the releasing thread never
//! pays for a large clear. The worker stages cleared lists and moves them
//! into the shared pools under one lock acquisition per batch.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// Maximum number of lists the worker clears before publishing them.
const STAGING_BATCH: usize = 32;

/// Tuning knobs for a [`ListPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListPoolConfig {
    /// Maximum number of pooled small lists.
    pub small_pool_capacity: usize,
    /// Maximum number of pooled large lists.
    pub large_pool_capacity: usize,
    /// Capacity of freshly built lists.
    pub initial_item_capacity: usize,
    /// Largest capacity routed to the small pool.
    pub small_max_item_size: usize,
    /// Largest capacity kept at all. Bigger lists are dropped on release.
    pub large_max_item_size: usize,
    /// Lists longer than this are cleared on the background worker.
    pub clear_threshold: usize,
}

impl Default for ListPoolConfig {
    fn default() -> Self {
        Self {
            small_pool_capacity: 256,
            large_pool_capacity: 4,
            initial_item_capacity: 64,
            small_max_item_size: 512,
            large_max_item_size: 10_240,
            clear_threshold: 512,
        }
    }
}

struct Shared<T> {
    config: ListPoolConfig,
    small: Mutex<Vec<Vec<T>>>,
    large: Mutex<Vec<Vec<T>>>,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl<T> Shared<T> {
    /// Routes cleared lists into the small or large pool.
    fn store_many(&self, lists: &mut Vec<Vec<T>>) {
        let small_max = self.config.small_max_item_size;
        {
            let mut small = self.small.lock();
            let mut i = 0;
            while i < lists.len() {
                if lists[i].capacity() <= small_max {
                    let list = lists.swap_remove(i);
                    if small.len() < self.config.small_pool_capacity {
                        small.push(list);
                    }
                } else {
                    i += 1;
                }
            }
        }
        if lists.is_empty() {
            return;
        }
        let mut large = self.large.lock();
        for list in lists.drain(..) {
            if large.len() < self.config.large_pool_capacity {
                large.push(list);
            }
        }
    }

    fn finish_work(&self, count: usize) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(count);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

struct ClearWorker<T> {
    sender: Option<Sender<Vec<T>>>,
    handle: Option<JoinHandle<()>>,
}

/// A pool of `Vec<T>` split into a small tier and a large tier.
///
/// # Thread Safety
///
/// `allocate` and `release` take `&self` and may be called from any thread.
///
/// # Example
///
/// ```rust,ignore
/// let pool: ListPool<u32> = ListPool::new(ListPoolConfig::default());
///
/// let mut list = pool.allocate(None);
/// list.extend(0..10_000);
/// pool.release(list); // cleared on the worker thread
///
/// pool.wait_for_work_items(Duration::from_secs(1));
/// ```
pub struct ListPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: ClearWorker<T>,
}

impl<T: Send + 'static> ListPool<T> {
    /// Creates a new list pool and starts its clearing worker.
    ///
    /// If the worker thread cannot be spawned, large lists are cleared
    /// inline instead.
    #[must_use]
    pub fn new(config: ListPoolConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            small: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
            pending: Mutex::new(0),
            drained: Condvar::new(),
        });

        let (sender, receiver) = unbounded::<Vec<T>>();
        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("prism-list-clear".into())
            .spawn(move || clear_loop(&worker_shared, &receiver));

        let worker = match spawned {
            Ok(handle) => ClearWorker {
                sender: Some(sender),
                handle: Some(handle),
            },
            Err(error) => {
                tracing::warn!("List clearing worker unavailable, clearing inline: {}", error);
                ClearWorker {
                    sender: None,
                    handle: None,
                }
            }
        };

        Self { shared, worker }
    }

    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ListPoolConfig {
        &self.shared.config
    }

    /// Takes an empty list out of the pool.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Optional capacity hint. Hints above the small item size
    ///   are served from the large pool first.
    pub fn allocate(&self, capacity: Option<usize>) -> Vec<T> {
        let config = &self.shared.config;
        let wanted = capacity.unwrap_or(config.initial_item_capacity);

        let pooled = if wanted > config.small_max_item_size {
            self.shared
                .large
                .lock()
                .pop()
                .or_else(|| self.shared.small.lock().pop())
        } else {
            self.shared.small.lock().pop()
        };

        match pooled {
            Some(mut list) => {
                if list.capacity() < wanted {
                    list.reserve(wanted);
                }
                list
            }
            None => Vec::with_capacity(wanted.max(config.initial_item_capacity)),
        }
    }

    /// Returns a list to the pool.
    ///
    /// Lists whose capacity exceeds the large item size are dropped. Lists
    /// longer than the clear threshold are cleared on the worker thread.
    pub fn release(&self, mut list: Vec<T>) {
        let config = &self.shared.config;
        if list.capacity() > config.large_max_item_size {
            return;
        }

        if list.len() > config.clear_threshold {
            if let Some(sender) = &self.worker.sender {
                *self.shared.pending.lock() += 1;
                match sender.send(list) {
                    Ok(()) => return,
                    Err(returned) => {
                        self.shared.finish_work(1);
                        list = returned.into_inner();
                    }
                }
            }
        }

        list.clear();
        let mut single = vec![list];
        self.shared.store_many(&mut single);
    }

    /// Blocks until every queued clear has been published to the pool.
    ///
    /// # Returns
    ///
    /// `true` if the queue drained before the timeout elapsed.
    pub fn wait_for_work_items(&self, timeout: Duration) -> bool {
        let mut pending = self.shared.pending.lock();
        if *pending == 0 {
            return true;
        }
        let _ = self
            .shared
            .drained
            .wait_while_for(&mut pending, |pending| *pending > 0, timeout);
        *pending == 0
    }

    /// Returns the number of pooled small and large lists.
    #[must_use]
    pub fn pooled_counts(&self) -> (usize, usize) {
        (self.shared.small.lock().len(), self.shared.large.lock().len())
    }
}

impl<T: Send + 'static> Drop for ListPool<T> {
    fn drop(&mut self) {
        self.worker.sender.take();
        if let Some(handle) = self.worker.handle.take() {
            if handle.join().is_err() {
                tracing::error!("List clearing worker panicked");
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for ListPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListPool")
            .field("config", &self.shared.config)
            .field("pooled", &self.pooled_counts())
            .finish_non_exhaustive()
    }
}

fn clear_loop<T>(shared: &Shared<T>, receiver: &Receiver<Vec<T>>) {
    let mut staging: Vec<Vec<T>> = Vec::with_capacity(STAGING_BATCH);

    while let Ok(first) = receiver.recv() {
        staging.push(first);
        while staging.len() < STAGING_BATCH {
            match receiver.try_recv() {
                Ok(list) => staging.push(list),
                Err(_) => break,
            }
        }

        for list in &mut staging {
            list.clear();
        }

        let count = staging.len();
        shared.store_many(&mut staging);
        staging.clear();
        shared.finish_work(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ListPoolConfig {
        ListPoolConfig {
            small_pool_capacity: 4,
            large_pool_capacity: 2,
            initial_item_capacity: 8,
            small_max_item_size: 64,
            large_max_item_size: 4096,
            clear_threshold: 16,
        }
    }

    #[test]
    fn test_small_list_round_trip() {
        let pool: ListPool<u32> = ListPool::new(small_config());

        let mut list = pool.allocate(None);
        assert!(list.capacity() >= 8);
        list.extend(0..4);
        pool.release(list);

        assert_eq!(pool.pooled_counts(), (1, 0));
        let list = pool.allocate(None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_large_list_cleared_in_background() {
        let pool: ListPool<u32> = ListPool::new(small_config());

        let mut list = pool.allocate(Some(1000));
        list.extend(0..1000);
        pool.release(list);

        assert!(pool.wait_for_work_items(Duration::from_secs(5)));
        assert_eq!(pool.pooled_counts(), (0, 1));

        let list = pool.allocate(Some(1000));
        assert!(list.is_empty());
        assert!(list.capacity() >= 1000);
    }

    #[test]
    fn test_oversized_list_dropped() {
        let pool: ListPool<u8> = ListPool::new(small_config());

        let list = Vec::with_capacity(10_000);
        pool.release(list);

        assert!(pool.wait_for_work_items(Duration::from_secs(1)));
        assert_eq!(pool.pooled_counts(), (0, 0));
    }

    #[test]
    fn test_pool_capacity_respected() {
        let pool: ListPool<u8> = ListPool::new(small_config());
        for _ in 0..10 {
            pool.release(Vec::with_capacity(8));
        }
        assert_eq!(pool.pooled_counts().0, 4);
    }

    #[test]
    fn test_background_clear_drops_items() {
        let marker = Arc::new(());
        let pool: ListPool<Arc<()>> = ListPool::new(small_config());

        let mut list = pool.allocate(Some(100));
        for _ in 0..100 {
            list.push(Arc::clone(&marker));
        }
        assert_eq!(Arc::strong_count(&marker), 101);

        pool.release(list);
        assert!(pool.wait_for_work_items(Duration::from_secs(5)));
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
