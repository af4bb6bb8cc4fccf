//! # framejob — a fork-join job scheduler for frame-driven workloads
//!
//! A fixed pool of worker threads executes small one-shot jobs from
//! per-worker queues, with work stealing between them. What sets this
//! scheduler apart from a generic thread pool is its implicit dependency
//! tracking: a job submitted from inside another job is parented to it, so
//! "run this and everything it spawns" is a single [`JobSystem::run_job`]
//! call, and a job can register a continuation that runs only after all of
//! its children complete. Job records live in a pooled arena with
//! thread-local free lists, keeping allocation off the hot path.
//!
//! Key pieces:
//!
//! - **Job records**: pooled 128-byte blocks holding an inline type-erased
//!   closure, parent/continuation links and the outstanding-work counter.
//! - **Queues**: one local (thread-affine) and one global (stealable) FIFO
//!   per worker, each behind a spinlock.
//! - **Workers**: pop local, steal round-robin, drain deferred frees, and
//!   nap for at most a millisecond when idle.
//! - **Cooperative waiting**: a job waiting for its children executes other
//!   jobs instead of blocking, so the pool never starves itself.
//!
//! ## Example
//!
//! ```
//! use framejob::{JobSystem, JobSystemConfig};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = JobSystem::with_config(JobSystemConfig {
//!     workers: Some(2),
//!     ..JobSystemConfig::default()
//! });
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&done);
//! scheduler.run_job_with(move |cx| {
//!     for _ in 0..16 {
//!         let counter = Arc::clone(&counter);
//!         cx.schedule(move || {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!         });
//!     }
//! });
//! assert_eq!(done.load(Ordering::Relaxed), 16);
//! scheduler.shutdown().unwrap();
//! ```

mod job;
mod pool;
mod queue;
mod scheduler;
mod worker;

#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "trace")]
pub mod trace;

pub use pool::PoolStats;
pub use scheduler::{JobContext, JobSystem, JobSystemConfig};
pub use worker::worker_index;
