//! Optional scheduler counters (enable the `metrics` feature).
//!
//! Counters are plain relaxed atomics bumped on the scheduling paths; read
//! them through [`MetricsSnapshot`] via `JobSystem::metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    /// Jobs whose closure ran to completion (or panicked).
    pub(crate) jobs_completed: AtomicU64,
    /// Pushes to thread-affine local queues.
    pub(crate) local_pushes: AtomicU64,
    /// Pushes to stealable global queues.
    pub(crate) global_pushes: AtomicU64,
    /// Jobs popped from another worker's global queue.
    pub(crate) steals: AtomicU64,
    /// Records served from a thread-local free list instead of the pool.
    pub(crate) records_recycled: AtomicU64,
    started: Instant,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Metrics {
            jobs_completed: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            global_pushes: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            records_recycled: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            global_pushes: self.global_pushes.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            records_recycled: self.records_recycled.load(Ordering::Relaxed),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub local_pushes: u64,
    pub global_pushes: u64,
    pub steals: u64,
    pub records_recycled: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Submissions not yet matched by an execution.
    pub fn queued_depth(&self) -> i64 {
        (self.local_pushes + self.global_pushes) as i64 - self.jobs_completed as i64
    }
}
