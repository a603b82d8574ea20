//! [`Lock`] is the reader-writer lock guarding the overflow array of a single bucket.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crate::maybe_std::AtomicU32;
#[cfg(feature = "loom")]
use crate::maybe_std::yield_now;
#[cfg(not(feature = "loom"))]
use crate::wait_queue::WaitQueue;

/// Set when at least one thread is parked in the wait queue.
const WAITING: u32 = 1_u32 << 31;

/// Set while the lock is held exclusively.
const XLOCK: u32 = 1_u32 << 30;

/// The maximum number of shared owners.
const SLOCK_MAX: u32 = XLOCK - 1;

/// A single shared owner.
const SLOCK: u32 = 1_u32;

const LOCK_MASK: u32 = XLOCK | SLOCK_MAX;

/// The number of failed attempts before the thread parks itself.
#[cfg(not(feature = "loom"))]
const SPIN_LIMIT: usize = 32;

/// [`Lock`] is a word-sized reader-writer lock that parks contending threads in a
/// [`WaitQueue`].
///
/// Lock and unlock are separate calls; the bucket guards tie them to a scope.
pub(crate) struct Lock {
    state: AtomicU32,
    #[cfg(not(feature = "loom"))]
    wait_queue: WaitQueue,
}

impl Lock {
    /// Creates an unlocked [`Lock`].
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            #[cfg(not(feature = "loom"))]
            wait_queue: WaitQueue::default(),
        }
    }

    /// Acquires the lock exclusively, blocking the thread until it succeeds.
    pub(crate) fn lock_exclusive(&self) {
        loop {
            if self.try_lock_exclusive() || self.wait(|| self.try_lock_exclusive()) {
                return;
            }
        }
    }

    /// Acquires the lock in shared mode, blocking the thread until it succeeds.
    pub(crate) fn lock_shared(&self) {
        loop {
            if self.try_lock_shared() || self.wait(|| self.try_lock_shared()) {
                return;
            }
        }
    }

    /// Tries to acquire the lock exclusively without blocking.
    pub(crate) fn try_lock_exclusive(&self) -> bool {
        let mut current = self.state.load(Relaxed);
        loop {
            if current & LOCK_MASK != 0 {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(current, current | XLOCK, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Tries to acquire the lock in shared mode without blocking.
    pub(crate) fn try_lock_shared(&self) -> bool {
        let mut current = self.state.load(Relaxed);
        loop {
            if current & XLOCK != 0 || current & SLOCK_MAX == SLOCK_MAX {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(current, current + SLOCK, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases an exclusive lock.
    pub(crate) fn unlock_exclusive(&self) {
        let prev = self.state.fetch_and(!(XLOCK | WAITING), AcqRel);
        debug_assert_eq!(prev & XLOCK, XLOCK, "exclusive lock was not held");
        if prev & WAITING == WAITING {
            self.wakeup();
        }
    }

    /// Releases a shared lock.
    pub(crate) fn unlock_shared(&self) {
        let mut current = self.state.load(Relaxed);
        loop {
            debug_assert_ne!(current & SLOCK_MAX, 0, "shared lock was not held");
            match self.state.compare_exchange_weak(
                current,
                (current & !WAITING) - SLOCK,
                AcqRel,
                Relaxed,
            ) {
                Ok(prev) => {
                    if prev & WAITING == WAITING {
                        self.wakeup();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `true` if the lock is held in either mode.
    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.load(Relaxed) & LOCK_MASK != 0
    }

    /// Spins for a while, then parks the thread until the lock is released.
    ///
    /// Returns `true` if `f` acquired the lock in the meantime.
    #[cfg(not(feature = "loom"))]
    fn wait<F: Fn() -> bool>(&self, f: F) -> bool {
        for _ in 0..SPIN_LIMIT {
            std::hint::spin_loop();
            if f() {
                return true;
            }
        }
        self.wait_queue
            .wait_sync(|| {
                // The flag must be visible before the attempt, otherwise the owner could
                // release the lock without signaling.
                self.state.fetch_or(WAITING, AcqRel);
                f().then_some(())
            })
            .is_some()
    }

    #[cfg(feature = "loom")]
    fn wait<F: Fn() -> bool>(&self, f: F) -> bool {
        yield_now();
        f()
    }

    #[cfg(not(feature = "loom"))]
    fn wakeup(&self) {
        self.wait_queue.signal();
    }

    #[cfg(feature = "loom")]
    fn wakeup(&self) {}
}
