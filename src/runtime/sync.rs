//! Blocking synchronization primitives for the worker pool.
//!
//! The task queue needs a counting semaphore that worker threads can park
//! on. `std` provides the mutex and condition variable; `Semaphore` builds
//! the counter on top of them and adds a close operation so that parked
//! workers can be released at shutdown.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in the pool is a single push/pop, so the protected
/// state is never left half-updated by a panic.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Permits {
    available: usize,
    closed: bool,
}

/// Counting semaphore with a close flag.
///
/// After `close`, `acquire` keeps handing out the permits that are still
/// available and returns `false` once they run out instead of blocking.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<Permits>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(Permits {
                available: permits,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it.
    ///
    /// Returns `false` if the semaphore was closed and no permits remain.
    pub fn acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        loop {
            if permits.available > 0 {
                permits.available -= 1;
                return true;
            }
            if permits.closed {
                return false;
            }
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take a permit without blocking.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        if permits.available > 0 {
            permits.available -= 1;
            true
        } else {
            false
        }
    }

    /// Return one permit and wake a single waiter.
    pub fn release(&self) {
        lock(&self.permits).available += 1;
        self.cond.notify_one();
    }

    /// Close the semaphore and wake every waiter.
    pub fn close(&self) {
        lock(&self.permits).closed = true;
        self.cond.notify_all();
    }

    /// Permits currently available.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        lock(&self.permits).available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(2);
        assert!(sem.acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());

        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_release_wakes_blocked_acquire() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };

        thread::sleep(Duration::from_millis(20));
        sem.release();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_close_releases_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.acquire())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        sem.close();

        for waiter in waiters {
            assert!(!waiter.join().unwrap());
        }
    }

    #[test]
    fn test_close_drains_remaining_permits() {
        let sem = Semaphore::new(2);
        sem.close();
        assert!(sem.acquire());
        assert!(sem.acquire());
        assert!(!sem.acquire());
    }
}
