//! Job records and type-erased closure storage.
//!
//! A job is a one-shot unit of work: an inline closure plus the links and the
//! outstanding-work counter the completion protocol operates on. Records live
//! in fixed 128-byte pool blocks, so the closure is stored inline after the
//! header rather than boxed; oversized captures are rejected at submission.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::scheduler::JobContext;

/// Size of one pooled job block, header included.
pub(crate) const JOB_BLOCK_SIZE: usize = 128;
/// Blocks are aligned to their own size so the payload offset is predictable.
pub(crate) const JOB_BLOCK_ALIGN: usize = 128;
/// Usable closure storage in a standard block.
pub(crate) const JOB_INLINE_CAPACITY: usize = JOB_BLOCK_SIZE - size_of::<Job>();
/// Alignment guaranteed for the closure area (header size into an aligned block).
pub(crate) const PAYLOAD_ALIGN: usize = 32;

type CallFn = unsafe fn(*mut u8, &JobContext<'_>);
type DropFn = unsafe fn(*mut u8);

/// Dispatch table for the erased closure stored in a job's payload area.
pub(crate) struct JobVTable {
    call: CallFn,
    drop_in_place: DropFn,
}

/// A shared, non-owning pointer to a job record inside the pool arena.
///
/// Ownership of the record itself moves between a queue, an executing worker,
/// a thread-local cache and the pool; this pointer is just the address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct JobPtr(NonNull<Job>);

// SAFETY: job records are handed between threads by the queues; every access
// is serialized by the queue lock, the ambient-running-job convention or the
// pool mutex, and the counter is atomic.
unsafe impl Send for JobPtr {}

impl JobPtr {
    /// # Safety
    ///
    /// The record must still be part of a live pool arena.
    pub(crate) unsafe fn get(&self) -> &Job {
        self.0.as_ref()
    }

    /// The raw pool block backing this record.
    pub(crate) fn block(self) -> NonNull<u8> {
        self.0.cast()
    }
}

/// Header of a pooled job record. The closure payload follows it in the block.
#[repr(C)]
pub(crate) struct Job {
    /// Outstanding work items: the job itself plus every live child. Starts
    /// at 1; the job is done when it reaches zero.
    jobs_left: AtomicU32,
    /// Usable payload bytes in this block.
    capacity: u32,
    /// Job whose counter this one bubbles into on completion.
    parent: UnsafeCell<Option<JobPtr>>,
    /// Successor scheduled when `jobs_left` reaches zero.
    continuation: UnsafeCell<Option<JobPtr>>,
    /// `Some` exactly while the payload holds a live closure.
    vtable: UnsafeCell<Option<&'static JobVTable>>,
}

impl Job {
    /// Constructs a job header over a fresh pool block and returns its handle.
    ///
    /// # Safety
    ///
    /// `block` must point to at least `JOB_BLOCK_SIZE` bytes aligned to
    /// `JOB_BLOCK_ALIGN`, owned by the caller and not otherwise in use.
    pub(crate) unsafe fn init_block(block: NonNull<u8>) -> JobPtr {
        debug_assert_eq!(block.as_ptr() as usize % JOB_BLOCK_ALIGN, 0);
        debug_assert_eq!(size_of::<Job>() % PAYLOAD_ALIGN, 0);
        let record = block.cast::<Job>();
        record.as_ptr().write(Job {
            jobs_left: AtomicU32::new(1),
            capacity: JOB_INLINE_CAPACITY as u32,
            parent: UnsafeCell::new(None),
            continuation: UnsafeCell::new(None),
            vtable: UnsafeCell::new(None),
        });
        JobPtr(record)
    }

    pub(crate) fn jobs_left(&self) -> &AtomicU32 {
        &self.jobs_left
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    fn payload(&self) -> *mut u8 {
        // The payload sits directly after the header inside the same block.
        unsafe { (self as *const Job as *mut u8).add(size_of::<Job>()) }
    }

    /// Writes a closure into the inline payload and arms the vtable.
    ///
    /// Panics if the closure does not fit the block; callers with large
    /// captures must box them down to a pointer.
    ///
    /// # Safety
    ///
    /// The record must not currently hold a live closure and must not be
    /// visible to any other thread yet.
    pub(crate) unsafe fn store_closure<F>(&self, table: &'static JobVTable, closure: F) {
        assert!(
            size_of::<F>() <= self.capacity as usize,
            "job closure captures {} bytes but the record holds {}; box large captures",
            size_of::<F>(),
            self.capacity,
        );
        assert!(
            align_of::<F>() <= PAYLOAD_ALIGN,
            "job closure alignment {} exceeds the payload alignment {}",
            align_of::<F>(),
            PAYLOAD_ALIGN,
        );
        debug_assert!((*self.vtable.get()).is_none());
        self.payload().cast::<F>().write(closure);
        *self.vtable.get() = Some(table);
    }

    /// Moves the closure out of the payload and runs it. The vtable is cleared
    /// before the call, so a panicking closure is still consumed.
    ///
    /// # Safety
    ///
    /// Only the worker that owns the record (popped it from a queue or runs it
    /// as a root job) may call this, exactly once per stored closure.
    pub(crate) unsafe fn invoke(&self, cx: &JobContext<'_>) {
        let table = (*self.vtable.get())
            .take()
            .expect("job invoked without a live closure");
        (table.call)(self.payload(), cx);
    }

    /// Drops a closure that will never run (abandoned at shutdown).
    ///
    /// # Safety
    ///
    /// The record must be owned by the caller.
    pub(crate) unsafe fn drop_closure(&self) {
        if let Some(table) = (*self.vtable.get()).take() {
            (table.drop_in_place)(self.payload());
        }
    }

    /// # Safety
    ///
    /// Reads of the links are only meaningful while the caller owns the record
    /// or the completion protocol serializes access to it.
    pub(crate) unsafe fn parent(&self) -> Option<JobPtr> {
        *self.parent.get()
    }

    /// # Safety
    ///
    /// Caller must hold the record unpublished, or be the completion protocol.
    pub(crate) unsafe fn set_parent(&self, parent: Option<JobPtr>) {
        *self.parent.get() = parent;
    }

    /// # Safety
    ///
    /// Caller must be the worker currently executing this job.
    pub(crate) unsafe fn has_continuation(&self) -> bool {
        (*self.continuation.get()).is_some()
    }

    /// # Safety
    ///
    /// Caller must be the worker currently executing this job.
    pub(crate) unsafe fn set_continuation(&self, continuation: Option<JobPtr>) {
        *self.continuation.get() = continuation;
    }

    /// # Safety
    ///
    /// Caller must own the record via the completion protocol.
    pub(crate) unsafe fn take_continuation(&self) -> Option<JobPtr> {
        (*self.continuation.get()).take()
    }

    /// Returns the record to its post-allocation state: closure dropped, links
    /// cleared, counter re-armed at 1.
    ///
    /// # Safety
    ///
    /// The record must be owned by the caller and unreachable from any queue,
    /// child or continuation.
    pub(crate) unsafe fn reset(&self) {
        self.drop_closure();
        *self.parent.get() = None;
        *self.continuation.get() = None;
        self.jobs_left.store(1, Ordering::Relaxed);
    }
}

// -----------------------------------------------------------------------------
// Erased entry points

unsafe fn call_plain<F>(payload: *mut u8, _cx: &JobContext<'_>)
where
    F: FnOnce() + Send + 'static,
{
    let closure = payload.cast::<F>().read();
    closure();
}

unsafe fn call_context<F>(payload: *mut u8, cx: &JobContext<'_>)
where
    F: FnOnce(&JobContext) + Send + 'static,
{
    let closure = payload.cast::<F>().read();
    closure(cx);
}

unsafe fn drop_payload<F>(payload: *mut u8) {
    payload.cast::<F>().drop_in_place();
}

struct PlainVTable<F>(PhantomData<F>);

impl<F: FnOnce() + Send + 'static> PlainVTable<F> {
    const TABLE: JobVTable = JobVTable {
        call: call_plain::<F>,
        drop_in_place: drop_payload::<F>,
    };
}

struct ContextVTable<F>(PhantomData<F>);

impl<F: FnOnce(&JobContext) + Send + 'static> ContextVTable<F> {
    const TABLE: JobVTable = JobVTable {
        call: call_context::<F>,
        drop_in_place: drop_payload::<F>,
    };
}

/// Dispatch table for a `FnOnce()` closure.
pub(crate) fn plain_vtable<F: FnOnce() + Send + 'static>() -> &'static JobVTable {
    &PlainVTable::<F>::TABLE
}

/// Dispatch table for a `FnOnce(&JobContext)` closure.
pub(crate) fn context_vtable<F: FnOnce(&JobContext) + Send + 'static>() -> &'static JobVTable {
    &ContextVTable::<F>::TABLE
}
