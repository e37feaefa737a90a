//! Shared/exclusive lock with explicit ownership transfer.
//!
//! [`SharedLock`] is the "writer lock" of a file handle: any number of
//! writers hold it shared while modifying the cache file in place, and a
//! flush holds it exclusively while the file is uploaded.
//!
//! The exclusive side is acquired by the thread that queues a flush and
//! released by the flush worker that performs it. Rather than moving an OS
//! lock between threads, ownership is a plain [`LockOwner`] value recorded in
//! the lock state: the enqueuing thread detaches its guard, the worker calls
//! [`SharedLock::steal`] with its own identity, and later releases with that
//! identity. Releasing with the wrong owner is a consistency error.
//!
//! Shared acquisition is not recursive: a thread that already holds the lock
//! shared gets a consistency error instead of deadlocking against a pending
//! exclusive request.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::error::{CacheError, CacheResult};

/// Identity of a flush worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush-worker-{}", self.0)
    }
}

/// Who currently owns an exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// An ordinary thread (the one that acquired it).
    Thread(ThreadId),
    /// A flush worker that took the lock over.
    Worker(WorkerId),
}

impl LockOwner {
    /// The calling thread.
    pub fn current() -> Self {
        LockOwner::Thread(thread::current().id())
    }
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<LockOwner>,
    shared: HashSet<ThreadId>,
}

/// Lock allowing many shared holders or a single exclusive holder.
#[derive(Debug, Default)]
pub struct SharedLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl SharedLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock shared, waiting out any exclusive holder.
    ///
    /// Fails with [`CacheError::Retry`] if `deadline` passes first.
    pub fn lock_shared(&self, deadline: Option<Instant>) -> CacheResult<SharedGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.exclusive.is_some() {
            self.wait(&mut state, deadline, "shared lock")?;
        }
        if !state.shared.insert(me) {
            return Err(CacheError::consistency("SharedLock is not recursive"));
        }
        Ok(SharedGuard { lock: self, holder: me })
    }

    /// Acquire the lock exclusively, waiting for every shared holder and any
    /// other exclusive holder to leave.
    pub fn lock_exclusive(&self, deadline: Option<Instant>) -> CacheResult<ExclusiveGuard<'_>> {
        let owner = LockOwner::current();
        let mut state = self.state.lock();
        while state.exclusive.is_some() {
            self.wait(&mut state, deadline, "exclusive lock")?;
        }
        // Claim it before draining readers so new shared requests queue up
        // behind us.
        state.exclusive = Some(owner);
        while !state.shared.is_empty() {
            if let Err(e) = self.wait(&mut state, deadline, "exclusive lock") {
                state.exclusive = None;
                self.changed.notify_all();
                return Err(e);
            }
        }
        Ok(ExclusiveGuard {
            lock: self,
            owner: Some(owner),
        })
    }

    /// Reassign an exclusive lock to `new_owner`, returning the previous owner.
    pub fn steal(&self, new_owner: LockOwner) -> CacheResult<LockOwner> {
        let mut state = self.state.lock();
        match state.exclusive.replace(new_owner) {
            Some(previous) => Ok(previous),
            None => {
                state.exclusive = None;
                Err(CacheError::consistency(
                    "It is only possible to steal an exclusive lock",
                ))
            }
        }
    }

    /// Release an exclusive lock held by `owner`.
    pub fn release_exclusive(&self, owner: LockOwner) -> CacheResult<()> {
        let mut state = self.state.lock();
        match state.exclusive {
            Some(current) if current == owner => {
                state.exclusive = None;
                self.changed.notify_all();
                Ok(())
            }
            Some(current) => Err(CacheError::consistency(format!(
                "exclusive lock owned by {current:?}, release attempted by {owner:?}"
            ))),
            None => Err(CacheError::consistency("exclusive lock is not held")),
        }
    }

    /// Whether the lock is currently held exclusively.
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive.is_some()
    }

    /// The current exclusive owner, if any.
    pub fn exclusive_owner(&self) -> Option<LockOwner> {
        self.state.lock().exclusive
    }

    /// Number of shared holders.
    pub fn shared_count(&self) -> usize {
        self.state.lock().shared.len()
    }

    fn release_shared(&self, holder: ThreadId) {
        let mut state = self.state.lock();
        state.shared.remove(&holder);
        self.changed.notify_all();
    }

    fn wait(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Option<Instant>,
        what: &str,
    ) -> CacheResult<()> {
        match deadline {
            None => {
                self.changed.wait(state);
                Ok(())
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(CacheError::Retry(format!("timeout waiting for a {what}")));
                }
                self.changed.wait_until(state, deadline);
                Ok(())
            }
        }
    }
}

/// Shared hold on a [`SharedLock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a SharedLock,
    holder: ThreadId,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared(self.holder);
    }
}

/// Exclusive hold on a [`SharedLock`], released on drop unless detached.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a SharedLock,
    owner: Option<LockOwner>,
}

impl ExclusiveGuard<'_> {
    /// Keep the lock held past this guard's lifetime.
    ///
    /// Returns the recorded owner; whoever finishes the work must
    /// [`steal`](SharedLock::steal) it and then
    /// [`release_exclusive`](SharedLock::release_exclusive).
    pub fn detach(mut self) -> LockOwner {
        self.owner.take().unwrap_or_else(LockOwner::current)
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            if let Err(e) = self.lock.release_exclusive(owner) {
                tracing::error!(error = %e, "Failed to release exclusive lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn soon(ms: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(ms))
    }

    #[test]
    fn test_many_shared_holders() {
        let lock = Arc::new(SharedLock::new());
        let _mine = lock.lock_shared(None).unwrap();

        let other = Arc::clone(&lock);
        thread::spawn(move || {
            let _theirs = other.lock_shared(None).unwrap();
            assert_eq!(other.shared_count(), 2);
        })
        .join()
        .unwrap();

        assert_eq!(lock.shared_count(), 1);
    }

    #[test]
    fn test_shared_is_not_recursive() {
        let lock = SharedLock::new();
        let _guard = lock.lock_shared(None).unwrap();
        let err = lock.lock_shared(None).err().unwrap();
        assert!(matches!(err, CacheError::Consistency(_)));
    }

    #[test]
    fn test_exclusive_times_out_behind_shared() {
        let lock = Arc::new(SharedLock::new());
        let holder = Arc::clone(&lock);
        let release = Arc::new(AtomicBool::new(false));
        let release2 = Arc::clone(&release);
        let t = thread::spawn(move || {
            let _g = holder.lock_shared(None).unwrap();
            while !release2.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        });

        while lock.shared_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let err = lock.lock_exclusive(soon(30)).err().unwrap();
        assert!(err.is_retryable());
        // A failed exclusive attempt must not leave the lock claimed.
        assert!(!lock.is_exclusive());

        release.store(true, Ordering::Release);
        t.join().unwrap();
        let _g = lock.lock_exclusive(soon(1000)).unwrap();
    }

    #[test]
    fn test_shared_waits_for_exclusive() {
        let lock = SharedLock::new();
        let _g = lock.lock_exclusive(None).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let err = lock.lock_shared(soon(20)).err().unwrap();
                assert!(err.is_retryable());
            });
        });
    }

    #[test]
    fn test_exclusive_guard_drop_releases() {
        let lock = SharedLock::new();
        {
            let _g = lock.lock_exclusive(None).unwrap();
            assert!(lock.is_exclusive());
        }
        assert!(!lock.is_exclusive());
    }

    #[test]
    fn test_steal_and_release_from_worker() {
        let lock = Arc::new(SharedLock::new());
        let original = lock.lock_exclusive(None).unwrap().detach();
        assert_eq!(original, LockOwner::current());
        assert_eq!(lock.exclusive_owner(), Some(original));

        let worker_lock = Arc::clone(&lock);
        thread::spawn(move || {
            let me = LockOwner::Worker(WorkerId(3));
            let previous = worker_lock.steal(me).unwrap();
            assert!(matches!(previous, LockOwner::Thread(_)));
            assert_eq!(worker_lock.exclusive_owner(), Some(me));
            worker_lock.release_exclusive(me).unwrap();
        })
        .join()
        .unwrap();

        assert!(!lock.is_exclusive());
        assert_eq!(lock.exclusive_owner(), None);
        let _g = lock.lock_shared(soon(100)).unwrap();
    }

    #[test]
    fn test_steal_requires_exclusive() {
        let lock = SharedLock::new();
        let err = lock.steal(LockOwner::Worker(WorkerId(0))).unwrap_err();
        assert!(matches!(err, CacheError::Consistency(_)));
        assert!(!lock.is_exclusive());
    }

    #[test]
    fn test_release_by_wrong_owner_is_rejected() {
        let lock = SharedLock::new();
        let owner = lock.lock_exclusive(None).unwrap().detach();
        let err = lock
            .release_exclusive(LockOwner::Worker(WorkerId(9)))
            .unwrap_err();
        assert!(matches!(err, CacheError::Consistency(_)));
        assert!(lock.is_exclusive());
        lock.release_exclusive(owner).unwrap();
    }
}
