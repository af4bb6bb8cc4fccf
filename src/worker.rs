//! Worker threads and per-thread scheduler state.
//!
//! Each OS thread participating in the scheduler carries a small thread-local
//! block: its worker index, the job it is currently executing (the implicit
//! parent for new submissions), and the free/delete lists that keep record
//! allocation off the pool mutex. Background workers loop inside
//! `spawn_worker`; the foreground thread joins through `JobSystem::run_job`
//! or `join_as_worker`.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use core_affinity::CoreId;

use crate::job::JobPtr;
use crate::scheduler::Core;

/// Free-list records kept per thread before overflowing to the delete list.
pub(crate) const FREE_LIST_CAP: usize = 100;
/// Delete-list entries returned to the pool per drain (one lock acquisition).
pub(crate) const RETIRE_DRAIN_BATCH: usize = 64;

/// Per-thread scheduler state.
///
/// The `generation` tag names the scheduler instance the cached records belong
/// to. A thread that outlives a scheduler (test binaries create them
/// sequentially) must not feed records from a dead arena into a new pool, so
/// any generation mismatch clears the caches; the dead arena reclaims its
/// blocks wholesale when it drops.
pub(crate) struct ThreadState {
    pub(crate) index: Cell<usize>,
    pub(crate) generation: Cell<u64>,
    pub(crate) running: Cell<Option<JobPtr>>,
    pub(crate) running_generation: Cell<u64>,
    pub(crate) free: RefCell<Vec<JobPtr>>,
    pub(crate) retired: RefCell<Vec<JobPtr>>,
}

impl ThreadState {
    const fn new() -> Self {
        ThreadState {
            index: Cell::new(0),
            generation: Cell::new(0),
            running: Cell::new(None),
            running_generation: Cell::new(0),
            free: RefCell::new(Vec::new()),
            retired: RefCell::new(Vec::new()),
        }
    }

    /// Makes the caches safe to use with the given scheduler generation.
    pub(crate) fn ensure_generation(&self, generation: u64) {
        if self.generation.get() != generation {
            self.free.borrow_mut().clear();
            self.retired.borrow_mut().clear();
            self.generation.set(generation);
        }
    }

    /// Registers this thread as a worker of the given scheduler.
    pub(crate) fn bind(&self, generation: u64, index: usize) {
        self.ensure_generation(generation);
        self.index.set(index);
    }
}

thread_local! {
    pub(crate) static THREAD: ThreadState = const { ThreadState::new() };
}

/// The current thread's worker index, for affinity decisions.
///
/// Threads that never joined a scheduler report index 0 and submit through
/// worker 0's queues.
pub fn worker_index() -> usize {
    THREAD.with(|t| t.index.get())
}

/// One pass of the work loop: pop local, steal round-robin from the global
/// queues starting at our own, otherwise drain a batch of the delete list.
/// Returns false only when there was nothing at all to do.
pub(crate) fn try_work(core: &Core) -> bool {
    let count = core.worker_count();
    // A thread bound to a previous, larger scheduler may carry an index this
    // one has no slot for; such threads participate as worker 0.
    let index = THREAD.with(|t| t.index.get());
    let index = if index < count { index } else { 0 };
    let queues = core.queues();

    let job = queues[index].local.pop().or_else(|| {
        (0..count).find_map(|i| {
            let victim = (index + i) % count;
            let stolen = queues[victim].global.pop();
            #[cfg(feature = "metrics")]
            if stolen.is_some() && victim != index {
                core.metrics.steals.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            stolen
        })
    });

    match job {
        Some(job) => {
            core.execute(job);
            true
        }
        None => core.drain_retired_batch(),
    }
}

/// Spawns one background worker. It binds its thread-local state, optionally
/// pins itself, then alternates work passes with bounded condvar waits until
/// the stop flag is raised.
pub(crate) fn spawn_worker(
    core: Arc<Core>,
    index: usize,
    core_id: Option<CoreId>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("framejob-worker-{index}"))
        .spawn(move || {
            if let Some(core_id) = core_id {
                core_affinity::set_for_current(core_id);
            }
            THREAD.with(|t| t.bind(core.generation(), index));
            #[cfg(feature = "trace")]
            let _collector = crate::trace::CollectorGuard;

            while !core.stopping() {
                if !try_work(&core) {
                    core.idle_wait();
                }
            }
            // Hand cached records back so the pool accounts for everything.
            core.flush_thread_caches();
        })
        .expect("failed to spawn worker thread")
}
