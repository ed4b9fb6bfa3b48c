//! Mutex with a bounded acquisition.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{SyncError, SyncResult};

/// A named mutex whose acquisition fails after a timeout.
///
/// Guards a section that must only ever run once at a time, such as frame
/// preparation. A previous holder that never finishes turns into a
/// [`SyncError::LockTimeout`] rather than a silent deadlock.
#[derive(Debug)]
pub struct TimedLock {
    name: &'static str,
    timeout: Duration,
    inner: Mutex<()>,
}

/// Guard returned by [`TimedLock::lock`]. Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TimedLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl TimedLock {
    /// Creates a new lock.
    ///
    /// # Arguments
    ///
    /// * `name` - Shown in timeout errors
    /// * `timeout` - Default acquisition timeout
    #[must_use]
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            inner: Mutex::new(()),
        }
    }

    /// Returns the default acquisition timeout.
    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true if the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Acquires the lock with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockTimeout`] if the lock stays held for longer
    /// than the timeout.
    pub fn lock(&self) -> SyncResult<TimedLockGuard<'_>> {
        self.lock_for(self.timeout)
    }

    /// Acquires the lock, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockTimeout`] if the lock stays held for longer
    /// than `timeout`.
    pub fn lock_for(&self, timeout: Duration) -> SyncResult<TimedLockGuard<'_>> {
        self.inner
            .try_lock_for(timeout)
            .map(|guard| TimedLockGuard { _guard: guard })
            .ok_or(SyncError::LockTimeout {
                name: self.name,
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_and_release() {
        let lock = TimedLock::new("prepare", Duration::from_millis(50));
        {
            let _guard = lock.lock().unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert!(lock.lock().is_ok());
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let lock = Arc::new(TimedLock::new("prepare", Duration::from_millis(20)));
        let _guard = lock.lock().unwrap();

        let contender = Arc::clone(&lock);
        let result = thread::spawn(move || contender.lock().map(|_| ()))
            .join()
            .unwrap();

        assert_eq!(
            result,
            Err(SyncError::LockTimeout {
                name: "prepare",
                waited_ms: 20
            })
        );
    }
}
