//! Track allocation counters for Rmalloc.

use allocator_api2::alloc::Allocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of active allocations.
    pub allocation_count: usize,
    /// Total number of allocations.
    pub total_allocation_count: u64,

    /// Sum of active allocations' chunk sizes.
    pub allocated_bytes: usize,
    /// Sum of all allocations' chunk sizes.
    pub total_allocated_bytes: u64,

    /// Number of allocations served from the free lists.
    pub free_list_hits: u64,
    /// Bytes of reclaimed chunks handed out again, before splitting.
    pub free_list_bytes: u64,

    /// Number of compactions run.
    pub compaction_count: u64,
    /// Total compaction passes executed.
    pub total_compaction_passes: u64,
    /// Total bytes slid by compaction.
    pub total_bytes_moved: u64,

    /// Number of allocations that failed.
    pub oom_count: u64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_bytes: 0,
            total_allocated_bytes: 0,
            free_list_hits: 0,
            free_list_bytes: 0,
            compaction_count: 0,
            total_compaction_passes: 0,
            total_bytes_moved: 0,
            oom_count: 0,
        }
    }

    /// Returns the total number of allocated bytes freed.
    pub const fn total_freed_bytes(&self) -> u64 {
        self.total_allocated_bytes - self.allocated_bytes as u64
    }

    pub(crate) fn account_alloc(&mut self, size: usize) {
        self.allocation_count += 1;
        self.allocated_bytes += size;

        self.total_allocation_count += 1;
        self.total_allocated_bytes += size as u64;
    }

    pub(crate) fn account_free(&mut self, size: usize) {
        self.allocation_count -= 1;
        self.allocated_bytes -= size;
    }

    pub(crate) fn account_reuse(&mut self, chunk_size: usize) {
        self.free_list_hits += 1;
        self.free_list_bytes += chunk_size as u64;
    }

    /// A compaction grew an allocation to absorb an unusable remainder.
    pub(crate) fn account_fold(&mut self, size: usize) {
        self.allocated_bytes += size;
        self.total_allocated_bytes += size as u64;
    }

    pub(crate) fn account_compaction(&mut self, passes: usize, bytes_moved: usize) {
        self.compaction_count += 1;
        self.total_compaction_passes += passes as u64;
        self.total_bytes_moved += bytes_moved as u64;
    }

    pub(crate) fn account_oom(&mut self) {
        self.oom_count += 1;
    }
}

impl<O: super::OomHandler, A: Allocator + Clone> super::Rmalloc<O, A> {
    pub fn get_counters(&self) -> &Counters {
        &self.counters
    }
}
