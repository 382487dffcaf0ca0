//! Introspection of the arena.

use allocator_api2::alloc::Allocator;

use super::Rmalloc;
use crate::{error::fatal, header::ChunkState, llist::Chain, OomHandler, Span};

/// Number of chunks in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockCounts {
    pub free: usize,
    pub unlocked: usize,
    pub locked: usize,
    pub weak_locked: usize,
    /// Bytes held by Unlocked chunks, i.e. what compaction may move.
    pub unlocked_bytes: usize,
}

impl<O: OomHandler, A: Allocator + Clone> Rmalloc<O, A> {
    /// Calls `f` with the size of every chunk in the free lists.
    fn for_each_free_size(&self, mut f: impl FnMut(usize)) {
        for class in 0..self.classes.count() {
            let walked = self.classes.walk(&self.region, &self.headers, class, |h| {
                f(self.headers.get(h).size)
            });

            if let Err(violation) = walked {
                fatal(violation);
                return;
            }
        }
    }

    /// Total bytes across all free lists.
    pub fn total_free_bytes(&self) -> usize {
        let mut total = 0;
        self.for_each_free_size(|size| total += size);
        total
    }

    /// Size of the largest chunk in the free lists, or zero.
    pub fn largest_free_chunk(&self) -> usize {
        let mut largest = 0;
        self.for_each_free_size(|size| largest = largest.max(size));
        largest
    }

    /// The end of the highest chunk in use, as a region offset.
    ///
    /// The cheap form reads the cached highest header, which can be a Free
    /// chunk between compactions. The exact form scans every header.
    pub fn highest_used(&self, exact: bool) -> usize {
        if !exact {
            return self.highest.map_or(0, |h| self.headers.get(h).end());
        }

        self.live_chunks().map(|span| span.acme).max().unwrap_or(0)
    }

    fn chain(&self) -> impl Iterator<Item = &crate::header::Header> + '_ {
        self.headers
            .iter_chain(self.headers.chain)
            .take(self.headers.capacity())
            .map(|h| self.headers.get(h))
    }

    /// Number of chunks not Free.
    pub fn live_chunk_count(&self) -> usize {
        self.chain().filter(|header| !header.state.is_free()).count()
    }

    /// Spans of the chunks not Free, in header chain order.
    pub fn live_chunks(&self) -> impl Iterator<Item = Span> + '_ {
        self.chain()
            .filter(|header| !header.state.is_free())
            .map(|header| Span::from_base_size(header.addr, header.size))
    }

    pub fn block_counts(&self) -> BlockCounts {
        let mut counts = BlockCounts::default();
        for header in self.chain() {
            match header.state {
                ChunkState::Free => counts.free += 1,
                ChunkState::Unlocked => {
                    counts.unlocked += 1;
                    counts.unlocked_bytes += header.size;
                }
                ChunkState::Locked => counts.locked += 1,
                ChunkState::WeakLocked => counts.weak_locked += 1,
            }
        }
        counts
    }

    /// Bytes occupied by the header table.
    pub fn header_table_size(&self) -> usize {
        self.headers.footprint()
    }

    /// A printable map of the chunks in header chain order, one glyph each:
    /// `_` Free, `|` Unlocked, `X` Locked, `W` WeakLocked.
    ///
    /// The chain is in address order right after a compaction.
    pub fn layout_map(&self) -> LayoutMap<'_, O, A> {
        LayoutMap { rmalloc: self, only: None }
    }
}

/// See [`Rmalloc::layout_map`].
pub struct LayoutMap<'a, O: OomHandler, A: Allocator + Clone> {
    rmalloc: &'a Rmalloc<O, A>,
    only: Option<ChunkState>,
}

impl<'a, O: OomHandler, A: Allocator + Clone> LayoutMap<'a, O, A> {
    /// Only show chunks in `state`.
    pub fn only(self, state: ChunkState) -> Self {
        Self { only: Some(state), ..self }
    }
}

impl<'a, O: OomHandler, A: Allocator + Clone> core::fmt::Display for LayoutMap<'a, O, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for header in self.rmalloc.chain() {
            if self.only.map_or(true, |only| only == header.state) {
                write!(f, "{}", header.state.glyph())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::string::ToString;

    use super::*;
    use crate::{ErrOnOom, ManualClock};

    #[test]
    fn stats_track_states() {
        let mut rm = Rmalloc::new(ErrOnOom, 1 << 16).unwrap();
        let _a = rm.allocate(64).unwrap();
        let b = rm.allocate(128).unwrap();
        let c = rm.allocate(256).unwrap();
        let d = rm.allocate(32).unwrap();

        rm.free(b);
        rm.lock(c);
        rm.weak_lock(d);

        assert_eq!(rm.total_free_bytes(), 128);
        assert_eq!(rm.largest_free_chunk(), 128);
        assert_eq!(rm.live_chunk_count(), 3);
        assert_eq!(rm.highest_used(false), 480);
        assert_eq!(rm.highest_used(true), 480);
        assert_eq!(
            rm.block_counts(),
            BlockCounts { free: 1, unlocked: 1, locked: 1, weak_locked: 1, unlocked_bytes: 64 },
        );

        let mut spans: std::vec::Vec<Span> = rm.live_chunks().collect();
        spans.sort_by_key(|span| span.base);
        assert_eq!(spans, [Span::new(0, 64), Span::new(192, 448), Span::new(448, 480)]);

        assert!(rm.header_table_size() >= 4 * crate::header::HEADER_SIZE);

        rm.compact_with(0, &ManualClock::new());
        assert_eq!(rm.layout_map().to_string(), "|_XW");
        assert_eq!(rm.layout_map().only(ChunkState::Free).to_string(), "_");
    }

    #[test]
    fn cached_highest_may_be_free() {
        let mut rm = Rmalloc::new(ErrOnOom, 1 << 16).unwrap();
        let _a = rm.allocate(64).unwrap();
        let b = rm.allocate(64).unwrap();
        rm.free(b);

        assert_eq!(rm.highest_used(false), 128);
        assert_eq!(rm.highest_used(true), 64);

        rm.compact_with(0, &ManualClock::new());
        assert_eq!(rm.highest_used(false), 64);
    }
}
