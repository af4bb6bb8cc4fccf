//! Spinlocked FIFO job queues.
//!
//! Each worker owns two: a *local* queue only it pops (thread-affine
//! submissions land here) and a *global* queue any worker may steal from.
//! Scheduling rates are moderate, so a single-bit spinlock around a deque is
//! simpler to audit than a lock-free deque and fast enough.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

use crate::job::JobPtr;

/// Minimal test-and-test-and-set spinlock.
pub(crate) struct SpinLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        SpinLock {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        while self.held.swap(true, Ordering::Acquire) {
            // Spin on a plain load so contending cores don't bounce the line.
            while self.held.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

/// An unbounded FIFO of job pointers. Pop on empty returns `None`; blocking
/// is the worker loop's business, not the queue's.
pub(crate) struct JobQueue {
    items: SpinLock<VecDeque<JobPtr>>,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        JobQueue {
            items: SpinLock::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, job: JobPtr) {
        self.items.lock().push_back(job);
    }

    pub(crate) fn pop(&self) -> Option<JobPtr> {
        self.items.lock().pop_front()
    }

    /// Empties the queue; used when tearing the scheduler down.
    pub(crate) fn drain(&self) -> Vec<JobPtr> {
        self.items.lock().drain(..).collect()
    }
}

/// The local/global queue pair owned by one worker slot.
pub(crate) struct QueuePair {
    pub(crate) local: JobQueue,
    pub(crate) global: JobQueue,
}

impl QueuePair {
    pub(crate) fn new() -> Self {
        QueuePair {
            local: JobQueue::new(),
            global: JobQueue::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spinlock_preserves_fifo_order() {
        let queue = SpinLock::new(VecDeque::new());
        queue.lock().push_back(1);
        queue.lock().push_back(2);
        queue.lock().push_back(3);
        assert_eq!(queue.lock().pop_front(), Some(1));
        assert_eq!(queue.lock().pop_front(), Some(2));
        assert_eq!(queue.lock().pop_front(), Some(3));
        assert_eq!(queue.lock().pop_front(), None);
    }

    #[test]
    fn spinlock_excludes_concurrent_writers() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 10_000;

        let total = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *total.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*total.lock(), (THREADS * INCREMENTS) as u64);
    }
}
