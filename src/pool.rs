//! Fixed-block arena backing job records.
//!
//! One contiguous allocation carved into 128-byte blocks. A single mutex
//! guards a bump cursor over never-used blocks plus a stack of recycled ones;
//! the hot allocation path never gets here because workers keep thread-local
//! free lists and only fall back to the pool when those run dry.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::job::{JOB_BLOCK_ALIGN, JOB_BLOCK_SIZE};

/// Default arena capacity in blocks (2 MiB of job records).
pub(crate) const DEFAULT_POOL_BLOCKS: usize = 16 * 1024;

/// Occupancy snapshot of the job pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total blocks the arena can serve.
    pub capacity_blocks: usize,
    /// Blocks ever handed out from the untouched region. Stays flat once the
    /// recycling economy reaches steady state.
    pub fresh_blocks: usize,
    /// Recycled blocks currently parked in the pool, ready for reuse.
    pub pooled_free: usize,
}

struct Arena {
    base: NonNull<u8>,
    capacity_blocks: usize,
    next_fresh: usize,
    free: Vec<NonNull<u8>>,
}

// SAFETY: the arena owns its allocation; all mutation happens under the mutex.
unsafe impl Send for Arena {}

pub(crate) struct JobPool {
    inner: Mutex<Arena>,
}

impl JobPool {
    pub(crate) fn new(capacity_blocks: usize) -> Self {
        assert!(capacity_blocks > 0, "job pool needs at least one block");
        let layout = arena_layout(capacity_blocks);
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| handle_alloc_error(layout));
        JobPool {
            inner: Mutex::new(Arena {
                base,
                capacity_blocks,
                next_fresh: 0,
                free: Vec::new(),
            }),
        }
    }

    /// Hands out one uninitialized block, preferring recycled ones.
    ///
    /// Panics when the arena is exhausted: the pool must be sized for the
    /// peak number of live jobs.
    pub(crate) fn allocate(&self) -> NonNull<u8> {
        let mut arena = self.inner.lock();
        if let Some(block) = arena.free.pop() {
            return block;
        }
        assert!(
            arena.next_fresh < arena.capacity_blocks,
            "job pool exhausted ({} blocks live); size the pool for peak fan-out",
            arena.capacity_blocks,
        );
        let offset = arena.next_fresh * JOB_BLOCK_SIZE;
        arena.next_fresh += 1;
        // SAFETY: offset stays inside the arena allocation.
        unsafe { NonNull::new_unchecked(arena.base.as_ptr().add(offset)) }
    }

    /// Returns blocks to the pool. One lock acquisition for the whole batch.
    pub(crate) fn release_batch<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        let mut arena = self.inner.lock();
        arena.free.extend(blocks);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let arena = self.inner.lock();
        PoolStats {
            capacity_blocks: arena.capacity_blocks,
            fresh_blocks: arena.next_fresh,
            pooled_free: arena.free.len(),
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        let arena = self.inner.get_mut();
        // SAFETY: base was allocated in `new` with the same layout.
        unsafe { dealloc(arena.base.as_ptr(), arena_layout(arena.capacity_blocks)) };
    }
}

fn arena_layout(capacity_blocks: usize) -> Layout {
    Layout::from_size_align(capacity_blocks * JOB_BLOCK_SIZE, JOB_BLOCK_ALIGN)
        .expect("invalid job pool layout")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_aligned_and_distinct() {
        let pool = JobPool::new(8);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % JOB_BLOCK_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % JOB_BLOCK_ALIGN, 0);
    }

    #[test]
    fn released_blocks_are_reused_before_fresh_ones() {
        let pool = JobPool::new(8);
        let a = pool.allocate();
        pool.release_batch([a]);
        let b = pool.allocate();
        assert_eq!(a, b);
        assert_eq!(pool.stats().fresh_blocks, 1);
    }

    #[test]
    fn stats_track_occupancy() {
        let pool = JobPool::new(4);
        let a = pool.allocate();
        let _b = pool.allocate();
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity_blocks: 4,
                fresh_blocks: 2,
                pooled_free: 0
            }
        );
        pool.release_batch([a]);
        assert_eq!(pool.stats().pooled_free, 1);
    }

    #[test]
    #[should_panic(expected = "job pool exhausted")]
    fn exhaustion_is_fatal() {
        let pool = JobPool::new(2);
        let _a = pool.allocate();
        let _b = pool.allocate();
        let _c = pool.allocate();
    }
}
