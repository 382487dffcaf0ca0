//! The time-boxed compactor.
//!
//! Each pass finds a run of Free chunks in the address-ordered header chain and
//! slides Unlocked chunks down over it. Pinned chunks never move, and nothing
//! is moved past them unless the whole moved run fits below them.

use allocator_api2::alloc::Allocator;

use super::Rmalloc;
use crate::{
    arena::TRAILER_SIZE,
    clock::Clock,
    error::{fatal, InvariantViolation},
    header::{ChunkState, Handle},
    llist::{merge_sort, Chain},
    OomHandler,
};

/// What a call to [`compact_with`](Rmalloc::compact_with) achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompactionReport {
    /// Slide-and-relink passes executed.
    pub passes: usize,
    /// Bytes of client data copied.
    pub bytes_moved: usize,
    /// How far the high-water mark dropped.
    pub reclaimed: usize,
    /// Whether compaction ran out of work rather than time.
    pub completed: bool,
}

/// A run of consecutive chain headers.
#[derive(Debug, Clone, Copy)]
struct Run {
    first: Handle,
    last: Handle,
    size: usize,
}

enum Pass {
    Slid { cursor: Handle, bytes: usize },
    Skip { cursor: Handle },
    Done,
}

impl<O: OomHandler, A: Allocator + Clone> Rmalloc<O, A> {
    /// Compacts using the system's monotonic clock.
    ///
    /// See [`compact_with`](Rmalloc::compact_with).
    #[cfg(feature = "std")]
    pub fn compact(&mut self, budget_nanos: u64) -> CompactionReport {
        self.compact_with(budget_nanos, &crate::StdClock::new())
    }

    /// Slides Unlocked chunks down over Free chunks until there is nothing left
    /// to do or `budget_nanos` have elapsed according to `clock`.
    ///
    /// A budget of zero runs to completion. The budget is checked between
    /// passes; a pass, once started, always finishes, so the arena is
    /// consistent whenever this returns and a later call picks up where this
    /// one stopped.
    ///
    /// Afterwards, Free chunks above the highest used chunk are given back to
    /// the unallocated top of the region, adjacent Free chunks are merged and
    /// the free lists are rebuilt.
    pub fn compact_with<C: Clock>(&mut self, budget_nanos: u64, clock: &C) -> CompactionReport {
        let start = clock.now_nanos();
        let high_before = self.memory_high;
        let mut report = CompactionReport::default();

        self.sort_chain();

        let mut cursor = None;
        loop {
            if budget_nanos != 0 && clock.now_nanos().saturating_sub(start) >= budget_nanos {
                break;
            }

            match self.compaction_pass(cursor) {
                Ok(Pass::Slid { cursor: next, bytes }) => {
                    report.passes += 1;
                    report.bytes_moved += bytes;
                    cursor = Some(next);
                }
                Ok(Pass::Skip { cursor: next }) => cursor = Some(next),
                Ok(Pass::Done) => {
                    report.completed = true;
                    break;
                }
                Err(violation) => {
                    fatal(violation);
                    break;
                }
            }
        }

        self.settle();
        report.reclaimed = high_before.saturating_sub(self.memory_high);

        #[cfg(feature = "counters")]
        self.counters.account_compaction(report.passes, report.bytes_moved);

        log::debug!(
            "compacted: {} passes, {} bytes moved, {} bytes reclaimed, high-water mark {:#x}{}",
            report.passes,
            report.bytes_moved,
            report.reclaimed,
            self.memory_high,
            if report.completed { "" } else { " (budget exhausted)" },
        );

        self.scan_for_errors();
        report
    }

    /// Brings the header chain into ascending address order.
    fn sort_chain(&mut self) {
        let head = self.headers.chain;
        self.headers.chain = merge_sort(&mut self.headers, head, |headers, a, b| {
            headers.get(a).addr <= headers.get(b).addr
        });

        let mut prev_addr = 0;
        for h in self.headers.iter_chain(self.headers.chain).take(self.headers.capacity()) {
            let addr = self.headers.get(h).addr;
            if addr < prev_addr {
                fatal(InvariantViolation::UnsortedChain(addr));
                return;
            }
            prev_addr = addr;
        }
    }

    #[inline]
    fn state_of(&self, h: Handle) -> ChunkState {
        self.headers.get(h).state
    }

    /// Extends a run from `first` while `accept(header, run size so far)` holds for the next header.
    fn run_from(&self, first: Handle, mut accept: impl FnMut(ChunkState, usize, usize) -> bool) -> Run {
        let mut run = Run { first, last: first, size: self.headers.get(first).size };

        while let Some(next) = self.headers.next(run.last) {
            let header = self.headers.get(next);
            if !accept(header.state, header.size, run.size) {
                break;
            }
            run.size += header.size;
            run.last = next;
        }

        run
    }

    /// Releases every header of `run`; they describe space no client can reach.
    fn release_run(&mut self, run: Run) {
        let mut current = Some(run.first);
        while let Some(h) = current {
            current = self.headers.next(h);
            self.headers.release(h);
            if h == run.last {
                break;
            }
        }
    }

    /// Points `prev`, or the chain head if `None`, at `next`.
    fn link_after(&mut self, prev: Option<Handle>, next: Option<Handle>) {
        match prev {
            Some(prev) => self.headers.set_next(prev, next),
            None => self.headers.chain = next,
        }
    }

    /// Obtains a Free header describing `addr..addr+size`, unlinked.
    ///
    /// Compaction may dip into the header reserve.
    fn free_header(&mut self, addr: usize, size: usize) -> Option<Handle> {
        let h = self.headers.allocate(false, self.memory_high, 0)?;
        let header = self.headers.get_mut(h);
        header.addr = addr;
        header.size = size;
        header.state = ChunkState::Free;
        Some(h)
    }

    /// One slide-and-relink pass, starting the search after `cursor`.
    fn compaction_pass(&mut self, cursor: Option<Handle>) -> Result<Pass, InvariantViolation> {
        // find the next run of Free chunks
        let mut prev_free = cursor;
        let mut current = match cursor {
            Some(c) => self.headers.next(c),
            None => self.headers.chain,
        };
        let free_first = loop {
            match current {
                None => return Ok(Pass::Done),
                Some(h) if self.state_of(h).is_free() => break h,
                Some(h) => {
                    prev_free = Some(h);
                    current = self.headers.next(h);
                }
            }
        };
        let free = self.run_from(free_first, |state, _, _| state.is_free());

        // free space at the very top is handed back when settling
        let Some(after) = self.headers.next(free.last) else { return Ok(Pass::Done) };

        // find the run of Unlocked chunks to slide into it
        let (before_unlocked, unlocked) = if self.state_of(after).is_pinned() {
            let mut prev = free.last;
            let mut current = Some(after);
            let candidate = loop {
                let Some(h) = current else { return Ok(Pass::Done) };
                let header = self.headers.get(h);
                match header.state {
                    ChunkState::Free => return Ok(Pass::Skip { cursor: prev }),
                    ChunkState::Unlocked if header.size <= free.size => break h,
                    _ => {
                        prev = h;
                        current = header.next;
                    }
                }
            };

            let run = self.run_from(candidate, |state, size, sum| {
                state == ChunkState::Unlocked && sum + size <= free.size
            });
            (prev, run)
        } else {
            (free.last, self.run_from(after, |state, _, _| state == ChunkState::Unlocked))
        };

        let free_addr = self.headers.get(free.first).addr;
        let offset = self.headers.get(unlocked.first).addr - free_addr;
        if offset == 0 {
            return Err(InvariantViolation::ZeroOffset);
        }

        let adjacent = before_unlocked == free.last;
        let vacated_addr = self.headers.get(unlocked.first).addr;
        let unlocked_next = self.headers.next(unlocked.last);

        // slide the Unlocked run down
        let mut current = Some(unlocked.first);
        while let Some(h) = current {
            let header = self.headers.get_mut(h);
            let (src, size) = (header.addr, header.size);
            header.addr -= offset;
            current = header.next;

            self.region.copy_within(src, src - offset, size);
            if h == unlocked.last {
                break;
            }
        }

        self.release_run(free);
        self.link_after(prev_free, Some(unlocked.first));

        if adjacent {
            let Some(n) = self.free_header(free_addr + unlocked.size, free.size) else {
                return Err(InvariantViolation::HeaderExhausted);
            };
            self.headers.set_next(unlocked.last, Some(n));
            self.headers.set_next(n, unlocked_next);
        } else {
            let Some(vacated) = self.free_header(vacated_addr, unlocked.size) else {
                return Err(InvariantViolation::HeaderExhausted);
            };
            self.headers.set_next(before_unlocked, Some(vacated));
            self.headers.set_next(vacated, unlocked_next);

            let remainder = free.size - unlocked.size;
            let spare = if remainder >= TRAILER_SIZE {
                self.free_header(free_addr + unlocked.size, remainder)
            } else {
                None
            };

            match spare {
                Some(spare) => {
                    self.headers.set_next(unlocked.last, Some(spare));
                    self.headers.set_next(spare, Some(after));
                }
                None => {
                    if remainder != 0 {
                        log::trace!("folding {} bytes into {:?}", remainder, unlocked.last);
                        #[cfg(feature = "counters")]
                        self.counters.account_fold(remainder);
                    }
                    self.headers.get_mut(unlocked.last).size += remainder;
                    self.headers.set_next(unlocked.last, Some(after));
                }
            }
        }

        log::trace!(
            "slid {} bytes down by {:#x} to {:#x}{}",
            unlocked.size,
            offset,
            free_addr,
            if adjacent { "" } else { " past pinned chunks" },
        );

        Ok(Pass::Slid { cursor: unlocked.last, bytes: unlocked.size })
    }

    /// Merges adjacent Free chunks, hands the Free space above the highest
    /// used chunk back to the top of the region, shrinks the header table and
    /// rebuilds the free lists.
    fn settle(&mut self) {
        let capacity = self.headers.capacity();

        // merge runs of Free chunks into their first header
        let mut current = self.headers.chain;
        let mut steps = 0;
        while let Some(h) = current {
            steps += 1;
            if steps > capacity {
                fatal(InvariantViolation::CycleDetected);
                return;
            }

            if self.state_of(h).is_free() {
                while let Some(n) = self.headers.next(h).filter(|&n| self.state_of(n).is_free()) {
                    let absorbed = *self.headers.get(n);
                    let header = self.headers.get_mut(h);
                    header.size += absorbed.size;
                    header.next = absorbed.next;
                    self.headers.release(n);
                }
            }
            current = self.headers.next(h);
        }

        let (highest, memory_high) = self
            .headers
            .iter_chain(self.headers.chain)
            .take(capacity)
            .filter(|&h| !self.state_of(h).is_free())
            .map(|h| (Some(h), self.headers.get(h).end()))
            .max_by_key(|&(_, end)| end)
            .unwrap_or((None, 0));

        // drop Free chunks above the highest used one
        let mut prev = None;
        let mut current = self.headers.chain;
        while let Some(h) = current {
            let header = *self.headers.get(h);
            current = header.next;

            if header.state.is_free() && header.addr >= memory_high {
                self.link_after(prev, header.next);
                self.headers.release(h);
            } else {
                prev = Some(h);
            }
        }

        self.headers.shrink();

        self.classes.clear();
        let mut current = self.headers.chain;
        while let Some(h) = current {
            if self.state_of(h).is_free() {
                self.classes.insert(&self.region, &self.headers, h);
            }
            current = self.headers.next(h);
        }

        self.memory_high = memory_high;
        self.highest = highest;
    }
}
