//! # Spinlock
//!
//! Busy-wait mutual exclusion on a single atomic flag.
//!
//! Used where OS mutexes are unwanted: the allocator's critical sections are
//! a handful of array shifts, far shorter than a futex round trip. There is
//! no fairness and no parking. A thread that holds the lock for long stalls
//! every other caller.

#![allow(unsafe_code)]

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// A test-and-test-and-set spinlock.
///
/// ## Usage
///
/// ```rust,ignore
/// let lock = Spinlock::new();
///
/// lock.acquire();
/// // critical section
/// lock.release();
///
/// // Or scoped:
/// {
///     let _guard = lock.lock_scoped();
///     // critical section
/// }
/// ```
#[derive(Debug, Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    /// Creates an unlocked spinlock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn acquire(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // Read-only spin keeps the cache line shared until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock once, without waiting.
    #[inline]
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Must only be called by the holder.
    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Returns whether the lock is currently held. Diagnostic only.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    #[inline]
    #[must_use]
    pub fn lock_scoped(&self) -> SpinlockGuard<'_> {
        self.acquire();
        SpinlockGuard { lock: self }
    }
}

/// RAII guard returned by [`Spinlock::lock_scoped`].
#[derive(Debug)]
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// SAFETY: `acquire`/`try_acquire` only succeed on a false -> true transition
// with Acquire ordering, and `release` stores false with Release ordering, so
// at most one holder exists and its writes are visible to the next one.
unsafe impl RawMutex for Spinlock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        self.acquire();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.release();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Spinlock::is_locked(self)
    }
}

/// A mutex protecting `T` with a [`Spinlock`].
pub type SpinMutex<T> = lock_api::Mutex<Spinlock, T>;

/// Guard for a [`SpinMutex`].
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, Spinlock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let lock = Spinlock::new();
        assert!(!lock.is_locked());

        lock.acquire();
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());

        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_scoped_guard() {
        let lock = Spinlock::new();
        {
            let _guard = lock.lock_scoped();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_spin_mutex_counts() {
        let counter = Arc::new(SpinMutex::new(0u64));
        let threads = 8;
        let per_thread = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), threads * per_thread);
    }
}
