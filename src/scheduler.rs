//! The scheduler: submission API, completion protocol and lifecycle.
//!
//! A fixed pool of workers (the constructing thread is worker 0) executes
//! jobs from per-worker queues. Submitting from inside a job implicitly
//! parents the new job to the submitter, so a job is only *done* once its own
//! body and every transitive child have finished; `run_job` exploits that to
//! give the foreground thread a fork-join entry point that waits by working
//! rather than blocking.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::job::{
    context_vtable, plain_vtable, Job, JobPtr, JobVTable, JOB_INLINE_CAPACITY,
};
use crate::pool::{JobPool, PoolStats, DEFAULT_POOL_BLOCKS};
use crate::queue::QueuePair;
use crate::worker::{self, spawn_worker, FREE_LIST_CAP, RETIRE_DRAIN_BATCH, THREAD};

#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};

/// Distinguishes scheduler instances so thread-local record caches from a
/// dead instance are never fed into a live one.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Construction parameters for a [`JobSystem`].
#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    /// Worker count, foreground worker included. `None` means one per
    /// logical core.
    pub workers: Option<usize>,
    /// Job pool capacity in records; exhaustion is fatal, so size this for
    /// peak fan-out.
    pub pool_blocks: usize,
    /// Pin background workers to cores (linear mapping over the cores the OS
    /// reports).
    pub pin_workers: bool,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        JobSystemConfig {
            workers: None,
            pool_blocks: DEFAULT_POOL_BLOCKS,
            pin_workers: false,
        }
    }
}

enum Target {
    /// The worker's stealable queue.
    Global(usize),
    /// The worker's private queue; only that worker executes from it.
    Local(usize),
}

/// Shared scheduler state: queues, pool, sleep control. Workers hold it via
/// `Arc`; everything here is reachable from a [`JobSystem`] or a
/// [`JobContext`].
pub(crate) struct Core {
    queues: Box<[CachePadded<QueuePair>]>,
    pool: JobPool,
    idle_lock: Mutex<()>,
    idle_signal: Condvar,
    stop: AtomicBool,
    generation: u64,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Core {
    fn new(worker_count: usize, pool_blocks: usize, generation: u64) -> Self {
        let queues = (0..worker_count)
            .map(|_| CachePadded::new(QueuePair::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Core {
            queues,
            pool: JobPool::new(pool_blocks),
            idle_lock: Mutex::new(()),
            idle_signal: Condvar::new(),
            stop: AtomicBool::new(false),
            generation,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queues(&self) -> &[CachePadded<QueuePair>] {
        &self.queues
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify_workers();
    }

    /// Bounded sleep between work attempts. The 1 ms cap bounds the latency
    /// of a submission that races a worker going to sleep.
    pub(crate) fn idle_wait(&self) {
        let mut guard = self.idle_lock.lock();
        if !self.stopping() {
            let _ = self
                .idle_signal
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    pub(crate) fn notify_workers(&self) {
        self.idle_signal.notify_all();
    }

    /// The calling thread's worker index, clamped to this scheduler: threads
    /// bound to another instance (or none) submit as worker 0.
    fn current_index(&self) -> usize {
        THREAD.with(|t| {
            let index = t.index.get();
            if t.generation.get() == self.generation && index < self.worker_count() {
                index
            } else {
                0
            }
        })
    }

    // -------------------------------------------------------------------------
    // Record allocation and reclamation

    /// Fetches a reset record: thread-local free list first, pool second.
    fn fetch_record(&self, needed_bytes: usize) -> JobPtr {
        assert!(
            needed_bytes <= JOB_INLINE_CAPACITY,
            "job closure captures {needed_bytes} bytes but pool records hold \
             {JOB_INLINE_CAPACITY}; box large captures",
        );
        THREAD.with(|t| {
            t.ensure_generation(self.generation);
            let mut free = t.free.borrow_mut();
            let found = free
                .iter()
                // SAFETY: same generation, so every cached record belongs to
                // this scheduler's live arena.
                .rposition(|job| unsafe { job.get() }.capacity() as usize >= needed_bytes);
            if let Some(at) = found {
                let job = free.swap_remove(at);
                #[cfg(feature = "metrics")]
                self.metrics.records_recycled.fetch_add(1, Ordering::Relaxed);
                return job;
            }
            drop(free);
            let block = self.pool.allocate();
            // SAFETY: a pool block is aligned, unused and large enough.
            unsafe { Job::init_block(block) }
        })
    }

    fn make_job<F>(&self, table: &'static JobVTable, closure: F) -> JobPtr {
        let job = self.fetch_record(mem::size_of::<F>());
        // SAFETY: freshly fetched record, not yet published to any queue.
        unsafe { job.get().store_closure(table, closure) };
        job
    }

    /// Resets a finished record and parks it in the thread-local caches.
    ///
    /// # Safety
    ///
    /// The caller must own the record: nothing else may reference it.
    pub(crate) unsafe fn recycle(&self, job: JobPtr) {
        job.get().reset();
        THREAD.with(|t| {
            t.ensure_generation(self.generation);
            let mut free = t.free.borrow_mut();
            if free.len() < FREE_LIST_CAP {
                free.push(job);
            } else {
                t.retired.borrow_mut().push(job);
            }
        });
    }

    /// Returns one bounded batch of the delete list to the pool. Called when
    /// a worker finds no runnable work; reports whether anything was drained.
    pub(crate) fn drain_retired_batch(&self) -> bool {
        THREAD.with(|t| {
            t.ensure_generation(self.generation);
            let mut retired = t.retired.borrow_mut();
            if retired.is_empty() {
                return false;
            }
            let keep = retired.len().saturating_sub(RETIRE_DRAIN_BATCH);
            self.pool.release_batch(retired.drain(keep..).map(JobPtr::block));
            true
        })
    }

    /// Empties this thread's caches into the pool (worker exit, shutdown).
    pub(crate) fn flush_thread_caches(&self) {
        THREAD.with(|t| {
            if t.generation.get() != self.generation {
                return;
            }
            let mut blocks: Vec<_> = t.free.borrow_mut().drain(..).map(JobPtr::block).collect();
            blocks.extend(t.retired.borrow_mut().drain(..).map(JobPtr::block));
            if !blocks.is_empty() {
                self.pool.release_batch(blocks);
            }
        });
    }

    /// Drops closures of jobs still queued after the workers exited and
    /// returns their records to the pool.
    fn drain_abandoned(&self) {
        let mut blocks = Vec::new();
        for pair in self.queues.iter() {
            for queue in [&pair.local, &pair.global] {
                for job in queue.drain() {
                    // SAFETY: workers have stopped; the queues were the only
                    // owners of these records.
                    unsafe { job.get().reset() };
                    blocks.push(job.block());
                }
            }
        }
        if !blocks.is_empty() {
            self.pool.release_batch(blocks);
        }
    }

    // -------------------------------------------------------------------------
    // Submission

    /// If a job is running on this thread, adopt it as the parent: bump its
    /// counter *before* the child becomes visible so it cannot complete
    /// underneath us.
    fn adopt_ambient(&self, job: JobPtr) {
        THREAD.with(|t| {
            if t.running_generation.get() != self.generation {
                return;
            }
            if let Some(parent) = t.running.get() {
                // SAFETY: `job` is unpublished; `parent` is executing on this
                // thread and holds its own count until its body returns.
                unsafe {
                    if job.get().parent().is_some() {
                        return;
                    }
                    parent.get().jobs_left().fetch_add(1, Ordering::AcqRel);
                    job.get().set_parent(Some(parent));
                }
            }
        });
    }

    fn submit(&self, job: JobPtr, target: Target) {
        match target {
            Target::Global(worker) => {
                self.queues[worker].global.push(job);
                #[cfg(feature = "metrics")]
                self.metrics.global_pushes.fetch_add(1, Ordering::Relaxed);
            }
            Target::Local(worker) => {
                self.queues[worker].local.push(job);
                #[cfg(feature = "metrics")]
                self.metrics.local_pushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify_workers();
    }

    /// Common submission path for every `schedule*` flavor.
    fn inject<F>(
        &self,
        table: &'static JobVTable,
        closure: F,
        detached: bool,
        affinity: Option<usize>,
    ) {
        if let Some(index) = affinity {
            assert!(
                index < self.worker_count(),
                "worker index {index} out of range ({} workers)",
                self.worker_count(),
            );
        }
        let job = self.make_job(table, closure);
        if !detached {
            self.adopt_ambient(job);
        }
        let target = match affinity {
            Some(index) => Target::Local(index),
            None => Target::Global(self.current_index()),
        };
        self.submit(job, target);
    }

    /// Registers a continuation on the job running on this thread.
    fn set_continuation<F>(&self, table: &'static JobVTable, closure: F) {
        let ambient = THREAD.with(|t| {
            if t.running_generation.get() == self.generation {
                t.running.get()
            } else {
                None
            }
        });
        let ambient = ambient.expect("continuation registered outside a running job");
        // SAFETY: only the executing worker touches the continuation link
        // before the completion protocol takes it.
        unsafe {
            assert!(
                !ambient.get().has_continuation(),
                "job already has a continuation registered",
            );
        }
        let job = self.make_job(table, closure);
        // SAFETY: as above; the record is unpublished until completion.
        unsafe { ambient.get().set_continuation(Some(job)) };
    }

    // -------------------------------------------------------------------------
    // Execution

    /// Runs a job's closure with this thread's ambient-running-job set, panics
    /// contained. The ambient slot is cleared *before* the completion protocol
    /// so a scheduled continuation is not parented to the job it follows.
    fn run_closure(&self, job: JobPtr) {
        let previous = THREAD.with(|t| {
            t.running_generation.set(self.generation);
            t.running.replace(Some(job))
        });
        #[cfg(feature = "trace")]
        let span = crate::trace::SpanGuard::new("job", self.current_index());
        let cx = JobContext { core: self };
        // SAFETY: this worker owns the record; the closure runs exactly once.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { job.get().invoke(&cx) }));
        #[cfg(feature = "trace")]
        drop(span);
        THREAD.with(|t| t.running.set(previous));
        if let Err(payload) = outcome {
            eprintln!("framejob: job panicked: {}", panic_message(payload.as_ref()));
        }
        #[cfg(feature = "metrics")]
        self.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs a popped job to completion: closure, then completion protocol.
    pub(crate) fn execute(&self, job: JobPtr) {
        self.run_closure(job);
        // SAFETY: the job ran on this thread and nothing else owns it.
        unsafe { self.finish(job) };
    }

    /// Completion protocol. Consumes one count from `job`; on reaching zero,
    /// splices the continuation into the parent's accounting, schedules it,
    /// bubbles up to the parent and recycles the record.
    ///
    /// # Safety
    ///
    /// One call per count the caller is entitled to consume: a job's own
    /// count after running its body, or a child's bubble-up.
    pub(crate) unsafe fn finish(&self, job: JobPtr) {
        let prev = job.get().jobs_left().fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "job counter underflow");
        if prev != 1 {
            // Children outstanding; the last of them bubbles back here.
            return;
        }
        let parent = job.get().parent();
        if let Some(continuation) = job.get().take_continuation() {
            // The parent must account for the continuation before our own
            // decrement below can land there.
            if let Some(parent) = parent {
                parent.get().jobs_left().fetch_add(1, Ordering::AcqRel);
                continuation.get().set_parent(Some(parent));
            }
            self.submit(continuation, Target::Global(self.current_index()));
        }
        if let Some(parent) = parent {
            self.finish(parent);
        }
        self.recycle(job);
    }

    /// Fork-join entry: run the root inline, work while its descendants
    /// finish, then follow the continuation chain.
    fn run_root<F>(&self, table: &'static JobVTable, closure: F) {
        THREAD.with(|t| {
            t.ensure_generation(self.generation);
            assert!(
                !(t.running_generation.get() == self.generation && t.running.get().is_some()),
                "run_job called while a job is already running on this thread",
            );
        });
        let mut job = self.make_job(table, closure);
        loop {
            self.run_closure(job);
            // Wait by working: never block while descendants are in flight.
            // SAFETY: the root is never queued; this thread owns it.
            while unsafe { job.get() }.jobs_left().load(Ordering::Acquire) > 1 {
                if !worker::try_work(self) {
                    self.idle_wait();
                }
            }
            let next = unsafe { job.get().take_continuation() };
            let prev = unsafe { job.get() }.jobs_left().fetch_sub(1, Ordering::AcqRel);
            debug_assert_eq!(prev, 1);
            unsafe { self.recycle(job) };
            match next {
                Some(continuation) => job = continuation,
                None => break,
            }
        }
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

// -----------------------------------------------------------------------------
// Public handles

/// The job scheduler: a fixed worker pool, per-worker queues and a pooled
/// record arena behind a small submission API.
///
/// The thread that constructs the system becomes worker 0, the foreground
/// worker; it participates through [`JobSystem::run_job`] or
/// [`JobSystem::join_as_worker`]. Workers 1..N−1 are background threads.
///
/// # Example
///
/// ```
/// use framejob::{JobSystem, JobSystemConfig};
///
/// let scheduler = JobSystem::with_config(JobSystemConfig {
///     workers: Some(2),
///     ..JobSystemConfig::default()
/// });
/// scheduler.run_job_with(|cx| {
///     for _ in 0..8 {
///         cx.schedule(|| {
///             // per-frame work
///         });
///     }
/// });
/// scheduler.shutdown().unwrap();
/// ```
pub struct JobSystem {
    core: Arc<Core>,
    workers: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl JobSystem {
    /// A scheduler with one worker per logical core and default pool size.
    pub fn new() -> Self {
        Self::with_config(JobSystemConfig::default())
    }

    pub fn with_config(config: JobSystemConfig) -> Self {
        let worker_count = config.workers.unwrap_or_else(num_cpus::get).max(1);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(Core::new(worker_count, config.pool_blocks, generation));

        // The constructing thread is the foreground worker.
        THREAD.with(|t| t.bind(generation, 0));

        let core_ids = if config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let workers = (1..worker_count)
            .map(|index| {
                let core_id = (!core_ids.is_empty()).then(|| core_ids[index % core_ids.len()]);
                spawn_worker(Arc::clone(&core), index, core_id)
            })
            .collect();

        JobSystem {
            core,
            workers,
            torn_down: false,
        }
    }

    /// Workers in the pool, foreground worker included.
    pub fn worker_count(&self) -> usize {
        self.core.worker_count()
    }

    /// Submits a job to the current worker's global queue. If called from
    /// inside a job, the new job is parented to it and the enclosing
    /// `run_job` will wait for it.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.inject(plain_vtable::<F>(), work, false, None);
    }

    /// As [`schedule`](Self::schedule), for closures that submit further work
    /// through the [`JobContext`] they receive.
    pub fn schedule_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.inject(context_vtable::<F>(), work, false, None);
    }

    /// Fire-and-forget submission: never parented, so no enclosing job waits
    /// for it.
    pub fn schedule_detached<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.inject(plain_vtable::<F>(), work, true, None);
    }

    pub fn schedule_detached_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.inject(context_vtable::<F>(), work, true, None);
    }

    /// Submits to the *local* queue of `worker`, so only that worker executes
    /// the job. Parenting works as in [`schedule`](Self::schedule).
    pub fn schedule_on<F: FnOnce() + Send + 'static>(&self, worker: usize, work: F) {
        self.core.inject(plain_vtable::<F>(), work, false, Some(worker));
    }

    pub fn schedule_on_with<F: FnOnce(&JobContext) + Send + 'static>(
        &self,
        worker: usize,
        work: F,
    ) {
        self.core
            .inject(context_vtable::<F>(), work, false, Some(worker));
    }

    /// Runs `work` as a root job on the calling thread and returns once it,
    /// every transitive child and its whole continuation chain have
    /// completed. While waiting, the calling thread executes other jobs.
    ///
    /// Panics if called from inside a job.
    pub fn run_job<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.run_root(plain_vtable::<F>(), work);
    }

    /// As [`run_job`](Self::run_job) with a [`JobContext`] for fan-out.
    pub fn run_job_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.run_root(context_vtable::<F>(), work);
    }

    /// Runs the calling thread as a worker until [`stop`](Self::stop).
    /// Intended for the thread that constructed the system (worker 0), e.g.
    /// a main thread that hands itself over after setup.
    pub fn join_as_worker(&self) {
        THREAD.with(|t| t.ensure_generation(self.core.generation()));
        while !self.core.stopping() {
            if !worker::try_work(&self.core) {
                self.core.idle_wait();
            }
        }
        self.core.flush_thread_caches();
    }

    /// Signals shutdown. Workers finish their current job and exit; queued
    /// jobs may or may not run.
    pub fn stop(&self) {
        self.core.request_stop();
    }

    /// Stops the system and joins the background workers, reporting how many
    /// panicked. Abandoned queued jobs are dropped and their records
    /// returned to the pool.
    pub fn shutdown(mut self) -> Result<(), String> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), String> {
        self.torn_down = true;
        self.core.request_stop();
        let mut panicked = 0usize;
        for handle in mem::take(&mut self.workers) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        self.core.drain_abandoned();
        self.core.flush_thread_caches();
        if panicked > 0 {
            Err(format!("{panicked} worker thread(s) panicked"))
        } else {
            Ok(())
        }
    }

    /// Occupancy of the record pool; the recycling tests build on this.
    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool_stats()
    }

    /// Counters accumulated since construction.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if !self.torn_down {
            let _ = self.teardown();
        }
    }
}

/// Capabilities available to a running job body: submitting further work and
/// registering a continuation, without capturing the scheduler handle.
pub struct JobContext<'a> {
    core: &'a Core,
}

impl JobContext<'_> {
    /// Submits a child job; the enclosing job waits for it.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.inject(plain_vtable::<F>(), work, false, None);
    }

    pub fn schedule_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.inject(context_vtable::<F>(), work, false, None);
    }

    /// Submits work the enclosing job does *not* wait for.
    pub fn schedule_detached<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.inject(plain_vtable::<F>(), work, true, None);
    }

    pub fn schedule_detached_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.inject(context_vtable::<F>(), work, true, None);
    }

    /// Submits a child that only `worker` will execute.
    pub fn schedule_on<F: FnOnce() + Send + 'static>(&self, worker: usize, work: F) {
        self.core.inject(plain_vtable::<F>(), work, false, Some(worker));
    }

    pub fn schedule_on_with<F: FnOnce(&JobContext) + Send + 'static>(
        &self,
        worker: usize,
        work: F,
    ) {
        self.core
            .inject(context_vtable::<F>(), work, false, Some(worker));
    }

    /// Registers the successor of the current job: it is scheduled once this
    /// job and all of its children have completed, and the enclosing job's
    /// parent (if any) waits for it too.
    ///
    /// At most one continuation per job; registering a second is fatal.
    pub fn continuation<F: FnOnce() + Send + 'static>(&self, work: F) {
        self.core.set_continuation(plain_vtable::<F>(), work);
    }

    pub fn continuation_with<F: FnOnce(&JobContext) + Send + 'static>(&self, work: F) {
        self.core.set_continuation(context_vtable::<F>(), work);
    }

    /// The worker index this job is executing on.
    pub fn worker_index(&self) -> usize {
        crate::worker::worker_index()
    }

    pub fn worker_count(&self) -> usize {
        self.core.worker_count()
    }
}
