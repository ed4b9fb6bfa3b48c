//! Single-assignment completion cell.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{SyncError, SyncResult};

/// A value that is assigned exactly once and can be awaited with a timeout.
///
/// Used to hand a result from one thread to another: a producer suspends a
/// batch and completes the cell when its content is ready, the draw thread
/// completes a cell when a frame has been issued.
///
/// # Example
///
/// ```rust,ignore
/// let cell = Arc::new(CompletionCell::new());
/// let producer = Arc::clone(&cell);
/// thread::spawn(move || producer.complete(()));
/// cell.wait_timeout(Duration::from_secs(1))?;
/// ```
pub struct CompletionCell<T> {
    done: AtomicBool,
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Clone> CompletionCell<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            value: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Creates a cell that is already complete.
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self {
            done: AtomicBool::new(true),
            value: Mutex::new(Some(value)),
            condvar: Condvar::new(),
        }
    }

    /// Returns true once a value has been assigned.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Assigns the value and wakes every waiter.
    ///
    /// # Returns
    ///
    /// `false` if the cell was already complete. The first value wins.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.done.store(true, Ordering::Release);
        self.condvar.notify_all();
        true
    }

    /// Returns the value if the cell is complete.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        if !self.is_complete() {
            return None;
        }
        self.value.lock().clone()
    }

    /// Waits up to `timeout` for the value.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CompletionTimeout`] if the cell is still empty
    /// when the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> SyncResult<T> {
        let mut slot = self.value.lock();
        if slot.is_none() {
            let _ = self
                .condvar
                .wait_while_for(&mut slot, |value| value.is_none(), timeout);
        }
        slot.clone().ok_or(SyncError::CompletionTimeout {
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

impl<T: Clone> Default for CompletionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCell")
            .field("done", &self.done.load(Ordering::Acquire))
            .finish()
    }
}
