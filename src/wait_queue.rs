//! [`WaitQueue`] parks threads that failed to acquire a bucket lock.

use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Relaxed};
use std::sync::{Condvar, Mutex, PoisonError};

/// [`WaitQueue`] implements an unfair wait queue.
///
/// The sole purpose of the data structure is to avoid busy-waiting.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    /// Stores the address of the most recently pushed [`SyncWait`].
    wait_queue: AtomicUsize,
}

impl WaitQueue {
    /// Pushes the calling thread into the queue, runs `f`, and then blocks until signaled.
    ///
    /// If `f` succeeds, the queue is signaled right away so that the caller does not wait for
    /// a lock it already holds.
    #[inline]
    pub(crate) fn wait_sync<T, F: FnOnce() -> Option<T>>(&self, f: F) -> Option<T> {
        let mut current = self.wait_queue.load(Relaxed);
        let mut entry = SyncWait::new(current);
        let mut entry_mut = Pin::new(&mut entry);

        while let Err(actual) = self.wait_queue.compare_exchange_weak(
            current,
            entry_mut.as_mut().get_mut() as *mut SyncWait as usize,
            AcqRel,
            Relaxed,
        ) {
            current = actual;
            entry_mut.next = current;
        }

        let result = f();
        if result.is_some() {
            self.signal();
        }

        entry_mut.wait();
        result
    }

    /// Signals every thread in the [`WaitQueue`].
    #[inline]
    pub(crate) fn signal(&self) {
        let mut current = self.wait_queue.swap(0, AcqRel);

        // Flip the queue to wake up the oldest entries first.
        let mut prev = 0;
        while current != 0 {
            let entry_ref = unsafe { &mut *(current as *mut SyncWait) };
            let next = entry_ref.next;
            entry_ref.next = prev;
            prev = current;
            current = next;
        }

        current = prev;
        while current != 0 {
            let entry_ref = unsafe { &*(current as *const SyncWait) };
            let next = entry_ref.next;
            entry_ref.signal();
            current = next;
        }
    }
}

/// [`SyncWait`] is inserted into [`WaitQueue`] for the caller to synchronously wait until
/// signaled.
#[derive(Debug)]
struct SyncWait {
    next: usize,
    condvar: Condvar,
    mutex: Mutex<bool>,
}

impl SyncWait {
    /// Creates a new [`SyncWait`].
    const fn new(next: usize) -> Self {
        #[allow(clippy::mutex_atomic)]
        Self {
            next,
            condvar: Condvar::new(),
            mutex: Mutex::new(false),
        }
    }

    /// Waits for a signal.
    fn wait(&self) {
        #[allow(clippy::mutex_atomic)]
        let mut completed = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while !*completed {
            completed = self
                .condvar
                .wait(completed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sends a signal.
    fn signal(&self) {
        #[allow(clippy::mutex_atomic)]
        let mut completed = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        *completed = true;
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread::yield_now;

    #[test]
    fn wait_queue() {
        let num_threads = 8;
        let barrier = Arc::new(Barrier::new(num_threads + 1));
        let wait_queue = Arc::new(WaitQueue::default());
        let turn = Arc::new(AtomicUsize::new(0));
        let mut thread_handles = Vec::with_capacity(num_threads);
        for thread_id in 1..=num_threads {
            let barrier_clone = barrier.clone();
            let wait_queue_clone = wait_queue.clone();
            let turn_clone = turn.clone();
            thread_handles.push(std::thread::spawn(move || {
                barrier_clone.wait();
                while wait_queue_clone
                    .wait_sync(|| {
                        turn_clone
                            .compare_exchange(thread_id, thread_id + 1, Relaxed, Relaxed)
                            .ok()
                    })
                    .is_none()
                {
                    yield_now();
                }
                wait_queue_clone.signal();
            }));
        }

        barrier.wait();
        turn.fetch_add(1, Relaxed);
        wait_queue.signal();

        thread_handles
            .into_iter()
            .for_each(|t| assert!(t.join().is_ok()));
        assert_eq!(turn.load(Relaxed), num_threads + 1);
    }
}
