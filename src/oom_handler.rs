use allocator_api2::alloc::Allocator;

use crate::Rmalloc;

pub trait OomHandler: Sized {
    /// Given the allocator and the rounded `size` of the allocation that caused
    /// OOM, make room and return `Ok(())` or fail by returning `Err(())`.
    ///
    /// This function is called repeatedly if the allocator is still out of memory.
    /// Therefore an infinite loop will occur if `Ok(())` is repeatedly returned
    /// without freeing up any memory.
    fn handle_oom<A: Allocator + Clone>(rmalloc: &mut Rmalloc<Self, A>, size: usize) -> Result<(), ()>;
}

/// Doesn't handle out-of-memory conditions, immediate allocation error occurs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrOnOom;

impl OomHandler for ErrOnOom {
    fn handle_oom<A: Allocator + Clone>(_: &mut Rmalloc<Self, A>, _: usize) -> Result<(), ()> {
        Err(())
    }
}

/// An out-of-memory handler that runs an unbounded compaction upon OOM.
///
/// Allocation is retried only if the compaction lowered the high-water mark
/// or grew the largest free chunk, so a fully packed arena fails promptly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactOnOom;

impl OomHandler for CompactOnOom {
    fn handle_oom<A: Allocator + Clone>(rmalloc: &mut Rmalloc<Self, A>, size: usize) -> Result<(), ()> {
        let high = rmalloc.highest_used(false);
        let largest = rmalloc.largest_free_chunk();

        let report = rmalloc.compact_with(0, &crate::ManualClock::new());
        log::debug!("compacted on OOM for {} bytes: {:?}", size, report);

        if rmalloc.highest_used(false) < high || rmalloc.largest_free_chunk() > largest {
            Ok(())
        } else {
            Err(())
        }
    }
}
