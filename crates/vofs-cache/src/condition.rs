//! Condition variable with a per-operation deadline.

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CacheError, CacheResult};

/// A condition variable whose waits fail with [`CacheError::Retry`] once the
/// caller's deadline has passed.
///
/// The deadline belongs to the operation, not to a single wait: compute it
/// once with [`deadline`](Self::deadline) when the operation starts and pass
/// it to every wait the operation performs.
#[derive(Debug)]
pub struct CacheCondition {
    cond: Condvar,
    timeout: Option<Duration>,
}

impl CacheCondition {
    /// Creates a condition with the given per-operation timeout.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            cond: Condvar::new(),
            timeout,
        }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deadline for an operation starting now.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    /// Wait for a notification.
    ///
    /// Wakeups may be spurious, so callers re-check their predicate in a loop.
    /// Returns `Err(Retry)` when called with a deadline already in the past.
    pub fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> CacheResult<()> {
        match deadline {
            None => {
                self.cond.wait(guard);
                Ok(())
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(CacheError::Retry("Condition variable timeout".into()));
                }
                self.cond.wait_until(guard, deadline);
                Ok(())
            }
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_with_retry() {
        let cond = CacheCondition::new(Some(Duration::from_millis(20)));
        let lock = Mutex::new(false);
        let deadline = cond.deadline();

        let mut guard = lock.lock();
        let started = Instant::now();
        let err = loop {
            if *guard {
                panic!("never signalled");
            }
            if let Err(e) = cond.wait(&mut guard, deadline) {
                break e;
            }
        };
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), CacheCondition::new(None)));
        let waker = Arc::clone(&pair);

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            *waker.0.lock() = true;
            waker.1.notify_all();
        });

        let (lock, cond) = &*pair;
        let mut ready = lock.lock();
        while !*ready {
            cond.wait(&mut ready, None).unwrap();
        }
        drop(ready);
        t.join().unwrap();
    }

    #[test]
    fn test_no_timeout_means_no_deadline() {
        let cond = CacheCondition::new(None);
        assert!(cond.deadline().is_none());
        assert!(cond.timeout().is_none());
    }

    #[test]
    fn test_expired_deadline_fails_immediately() {
        let cond = CacheCondition::new(Some(Duration::ZERO));
        let lock = Mutex::new(());
        let mut guard = lock.lock();
        let err = cond.wait(&mut guard, Some(Instant::now())).unwrap_err();
        assert!(matches!(err, CacheError::Retry(_)));
    }
}
