use thiserror::Error;

use crate::{ChunkState, Handle};

/// Neither bump allocation nor the free lists could satisfy a request,
/// and the [`OomHandler`](crate::OomHandler) gave up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("out of memory")]
pub struct OutOfMemory;

/// An internal consistency failure of the arena.
///
/// These indicate a bug (in the allocator, or memory corruption through a stale
/// address). They are never expected in a correct program.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantViolation {
    #[error("free chunk of {size} bytes is filed under size class {class}")]
    SizeClassMismatch { class: usize, size: usize },
    #[error("cycle detected in a chain")]
    CycleDetected,
    #[error("chunks overlap at offset {0:#x}")]
    RegionOverlap(usize),
    #[error("chunk or table bound at offset {0:#x} is out of bounds")]
    OutOfBounds(usize),
    #[error("trailer record of {0:?} does not refer back to it")]
    TrailerMismatch(Handle),
    #[error("header chain is not in address order at offset {0:#x}")]
    UnsortedChain(usize),
    #[error("compaction computed a zero slide offset")]
    ZeroOffset,
    #[error("header table exhausted in the middle of compaction")]
    HeaderExhausted,
    #[error("accounted bytes exceed the region size")]
    Conservation,
}

/// A handle operation that breaks the chunk state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Misuse {
    #[error("{0:?} does not describe a chunk")]
    Dangling(Handle),
    #[error("{handle:?} is {state:?}, which does not permit this operation")]
    WrongState { handle: Handle, state: ChunkState },
}

/// Failure to establish an arena.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitError {
    #[error("a region of {size} bytes is too small, at least {min} are required")]
    RegionTooSmall { size: usize, min: usize },
    #[error("a region of {0} bytes is too large to index")]
    RegionTooLarge(usize),
    #[error("the backing allocator failed to provide the region")]
    AllocFailed,
}

/// Surfaces an internal consistency failure as loudly as the build allows.
///
/// Debug builds panic. Release builds log and let the caller degrade the
/// operation to a failure or no-op.
#[track_caller]
pub(crate) fn fatal(violation: InvariantViolation) {
    if cfg!(debug_assertions) {
        panic!("rmalloc invariant violated: {}", violation);
    }

    log::error!("rmalloc invariant violated: {}", violation);
}
