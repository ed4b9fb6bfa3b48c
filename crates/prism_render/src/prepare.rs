//! # Prepare Manager
//!
//! Runs the preparation phase of a container's batches, in sort order on the
//! calling thread or split into contiguous chunks across a worker pool.
//!
//! ## Parallel Preparation
//!
//! ```text
//! [b0 b1 b2 | b3 b4 b5 | b6 b7]     one chunk per worker
//!     │          │          │
//!  worker 0   worker 1   worker 2   each chunk prepared in order
//!     └──────────┴──────────┘
//!           scope barrier           caller blocks until all finish
//! ```
//!
//! Nested containers prepare their children sequentially on the worker that
//! owns the container, so a group never escapes its parent's chunk.

use std::time::Duration;

use parking_lot::Mutex;
use prism_core::{TimedLock, TimedLockGuard};

use crate::batch::BatchRef;
use crate::config::PrepareConfig;
use crate::error::{RenderError, RenderResult};
use crate::manager::RenderManager;

/// Per-pass preparation settings handed to every batch.
#[derive(Clone, Copy)]
pub struct PrepareContext<'a> {
    manager: &'a RenderManager,
    parallel: bool,
}

impl<'a> PrepareContext<'a> {
    /// Creates a context.
    ///
    /// # Arguments
    ///
    /// * `parallel` - Whether this pass may fan out across workers
    #[must_use]
    pub const fn new(manager: &'a RenderManager, parallel: bool) -> Self {
        Self { manager, parallel }
    }

    /// The manager owning the pools and buffer generators.
    #[inline]
    #[must_use]
    pub const fn manager(&self) -> &'a RenderManager {
        self.manager
    }

    /// Whether this pass may fan out across workers.
    #[inline]
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Context for a nested container's children.
    #[must_use]
    pub const fn nested(&self) -> Self {
        Self {
            manager: self.manager,
            parallel: false,
        }
    }

    /// How long a suspended batch is waited on.
    #[must_use]
    pub fn suspend_timeout(&self) -> Duration {
        self.manager.config().prepare.suspend_timeout()
    }
}

impl std::fmt::Debug for PrepareContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareContext")
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

/// Orchestrates batch preparation.
pub struct PrepareManager {
    workers: Option<rayon::ThreadPool>,
    worker_count: usize,
    prepare_lock: TimedLock,
}

impl PrepareManager {
    /// Creates a manager, starting the worker pool when preparation is
    /// threaded.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WorkerPool`] if the worker threads cannot be
    /// spawned.
    pub fn new(config: &PrepareConfig) -> RenderResult<Self> {
        let (workers, worker_count) = if config.threaded {
            let count = config.resolved_worker_count();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(count)
                .thread_name(|i| format!("prism-prepare-{i}"))
                .build()
                .map_err(|e| RenderError::WorkerPool(e.to_string()))?;
            tracing::info!("started {} preparation workers", count);
            (Some(pool), count)
        } else {
            (None, 1)
        };

        Ok(Self {
            workers,
            worker_count,
            prepare_lock: TimedLock::new("prepare", config.prepare_lock_timeout()),
        })
    }

    /// Number of preparation workers; 1 when preparation is sequential.
    #[inline]
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Prepares one batch.
    ///
    /// # Errors
    ///
    /// Propagates the batch's preparation error.
    pub fn prepare(&self, batch: &BatchRef, ctx: &PrepareContext<'_>) -> RenderResult<()> {
        batch.prepare(ctx)
    }

    /// Prepares `batches`, in parallel chunks when the context allows it.
    ///
    /// Every chunk runs to completion or to its first failure before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns the first preparation error observed.
    pub fn prepare_many(&self, batches: &[BatchRef], ctx: &PrepareContext<'_>) -> RenderResult<()> {
        let pool = match &self.workers {
            Some(pool) if ctx.is_parallel() && batches.len() > 1 => pool,
            _ => {
                for batch in batches {
                    batch.prepare(ctx)?;
                }
                return Ok(());
            }
        };

        let chunk_size = batches.len().div_ceil(self.worker_count);
        let first_error: Mutex<Option<RenderError>> = Mutex::new(None);
        let nested = ctx.nested();
        pool.scope(|scope| {
            for chunk in batches.chunks(chunk_size) {
                let first_error = &first_error;
                scope.spawn(move |_| {
                    for batch in chunk {
                        if let Err(error) = batch.prepare(&nested) {
                            first_error.lock().get_or_insert(error);
                            return;
                        }
                    }
                });
            }
        });

        match first_error.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Takes the global one-preparation-in-flight lock.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if a previous preparation still holds it.
    pub fn lock_for_prepare(&self) -> RenderResult<TimedLockGuard<'_>> {
        Ok(self.prepare_lock.lock()?)
    }

    /// Returns true while a preparation holds the global lock.
    #[must_use]
    pub fn is_preparing(&self) -> bool {
        self.prepare_lock.is_locked()
    }
}

impl std::fmt::Debug for PrepareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareManager")
            .field("worker_count", &self.worker_count)
            .field("preparing", &self.is_preparing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchKind, BatchPhase};
    use crate::config::RenderConfig;
    use crate::device::HeadlessDevice;
    use prism_core::SyncError;
    use std::sync::Arc;

    fn manager(threaded: bool) -> Arc<RenderManager> {
        let mut config = RenderConfig::single_threaded();
        config.prepare.threaded = threaded;
        config.prepare.worker_count = 4;
        config.prepare.prepare_lock_timeout_ms = 20;
        RenderManager::new(config, Arc::new(HeadlessDevice::new())).unwrap()
    }

    fn scissors(manager: &RenderManager, count: usize) -> Vec<BatchRef> {
        (0..count)
            .map(|_| {
                let batch = manager.allocate_batch(BatchKind::Scissor);
                batch.initialize(None, 0, None).unwrap();
                batch
            })
            .collect()
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(manager(false).preparer().worker_count(), 1);
        assert_eq!(manager(true).preparer().worker_count(), 4);
    }

    #[test]
    fn test_parallel_prepares_every_batch() {
        let manager = manager(true);
        let batches = scissors(&manager, 37);
        let ctx = PrepareContext::new(&manager, true);

        manager.preparer().prepare_many(&batches, &ctx).unwrap();

        assert!(batches.iter().all(|b| b.phase() == BatchPhase::Prepared));
    }

    #[test]
    fn test_parallel_reports_failure() {
        let manager = manager(true);
        let mut batches = scissors(&manager, 8);
        batches.push(manager.allocate_batch(BatchKind::Scissor));
        let ctx = PrepareContext::new(&manager, true);

        let result = manager.preparer().prepare_many(&batches, &ctx);
        assert!(matches!(result, Err(RenderError::BatchReleased(_))));
    }

    #[test]
    fn test_prepare_lock_times_out() {
        let manager = manager(false);
        let _held = manager.preparer().lock_for_prepare().unwrap();
        assert!(manager.preparer().is_preparing());

        let result = std::thread::scope(|s| {
            s.spawn(|| manager.preparer().lock_for_prepare().map(|_| ()))
                .join()
                .unwrap()
        });
        assert!(matches!(
            result,
            Err(RenderError::Sync(SyncError::LockTimeout { name: "prepare", .. }))
        ));
    }

    #[test]
    fn test_nested_context_is_sequential() {
        let manager = manager(true);
        let ctx = PrepareContext::new(&manager, true);
        assert!(ctx.is_parallel());
        assert!(!ctx.nested().is_parallel());
    }
}
