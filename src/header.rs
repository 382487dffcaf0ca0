//! The header table: one fixed-size metadata record per chunk.
//!
//! Headers live in a slab whose length mirrors the downward-growing table at
//! the top of the region: the `i`th slab entry conceptually occupies the
//! `i`th record below the region's end. Recycled records are kept on a LIFO
//! free-record chain threaded through `next_unused`, leaving `next` alone.

use core::num::NonZeroU32;

use allocator_api2::{alloc::Allocator, vec::Vec};

use crate::llist::Chain;

/// The pin state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkState {
    /// Reclaimed; the chunk's tail holds a trailer record.
    Free = 0,
    /// In use and movable by the compactor.
    Unlocked = 1,
    /// In use and pinned.
    Locked = 2,
    /// In use and pinned, as a soft lock for caller-side bookkeeping.
    WeakLocked = 3,
}

impl ChunkState {
    /// Whether the compactor must leave the chunk where it is.
    #[inline]
    pub fn is_pinned(self) -> bool {
        matches!(self, ChunkState::Locked | ChunkState::WeakLocked)
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self == ChunkState::Free
    }

    pub(crate) fn glyph(self) -> char {
        match self {
            ChunkState::Free => '_',
            ChunkState::Unlocked => '|',
            ChunkState::Locked => 'X',
            ChunkState::WeakLocked => 'W',
        }
    }
}

/// An opaque, address-stable reference to an allocation.
///
/// Owning a handle does not pin memory; see [`Rmalloc::lock`](crate::Rmalloc::lock).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(NonZeroU32);

impl Handle {
    #[inline]
    pub(crate) fn from_index(index: usize) -> Option<Self> {
        let raw = u32::try_from(index).ok()?.checked_add(1)?;
        NonZeroU32::new(raw).map(Self)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Packs the handle into a word for storage in a trailer record.
    #[inline]
    pub(crate) fn to_word(link: Option<Handle>) -> usize {
        link.map_or(0, |h| h.0.get() as usize)
    }

    #[inline]
    pub(crate) fn from_word(word: usize) -> Option<Handle> {
        u32::try_from(word).ok().and_then(NonZeroU32::new).map(Self)
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handle({})", self.index())
    }
}

/// Offset sentinel of a header that describes no chunk.
pub(crate) const UNSET: usize = usize::MAX;

/// Number of records kept in reserve for the compactor, which may need
/// up to two fresh headers in the middle of a pass.
pub(crate) const RESERVED_HEADERS: usize = 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) addr: usize,
    pub(crate) size: usize,
    pub(crate) next: Option<Handle>,
    pub(crate) next_unused: Option<Handle>,
    pub(crate) state: ChunkState,
}

/// Footprint of one record in the region.
pub(crate) const HEADER_SIZE: usize = core::mem::size_of::<Header>();

impl Header {
    const UNUSED: Header = Header {
        addr: UNSET,
        size: 0,
        next: None,
        next_unused: None,
        state: ChunkState::Free,
    };

    #[inline]
    pub(crate) fn is_unused(&self) -> bool {
        self.addr == UNSET
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.addr + self.size
    }
}

pub(crate) struct HeaderTable<A: Allocator> {
    slab: Vec<Header, A>,
    /// The top of the table, i.e. the end of the region.
    high: usize,
    /// Head of the chain of headers that describe chunks.
    pub(crate) chain: Option<Handle>,
    /// Head of the chain of recyclable records.
    free_records: Option<Handle>,
}

impl<A: Allocator> HeaderTable<A> {
    pub(crate) fn new_in(high: usize, alloc: A) -> Self {
        Self { slab: Vec::new_in(alloc), high, chain: None, free_records: None }
    }

    /// The lowest offset occupied by the table.
    #[inline]
    pub(crate) fn low(&self) -> usize {
        self.high - self.footprint()
    }

    /// Bytes occupied by the table.
    #[inline]
    pub(crate) fn footprint(&self) -> usize {
        self.slab.len() * HEADER_SIZE
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub(crate) fn has_free_record(&self) -> bool {
        self.free_records.is_some()
    }

    #[inline]
    pub(crate) fn get(&self, h: Handle) -> &Header {
        &self.slab[h.index()]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, h: Handle) -> &mut Header {
        &mut self.slab[h.index()]
    }

    /// Returns the header if `h` names a record that currently describes a chunk.
    pub(crate) fn live(&self, h: Handle) -> Option<&Header> {
        self.slab.get(h.index()).filter(|header| !header.is_unused())
    }

    /// Obtains a record, recycling before carving.
    ///
    /// A record is only carved if `reserve` more records would still fit
    /// between the table and `floor`, the bump allocation high-water mark.
    pub(crate) fn allocate(&mut self, link_into_chain: bool, floor: usize, reserve: usize) -> Option<Handle> {
        let h = match self.free_records {
            Some(h) => {
                self.free_records = self.get(h).next_unused;
                h
            }
            None => {
                let needed = HEADER_SIZE.checked_mul(1 + reserve)?;
                if self.low().checked_sub(needed)? < floor {
                    return None;
                }

                let h = Handle::from_index(self.slab.len())?;
                self.slab.push(Header::UNUSED);
                log::trace!("carved {:?}, header table now {} bytes", h, self.footprint());
                h
            }
        };

        let next = if link_into_chain { self.chain } else { None };
        *self.get_mut(h) = Header { state: ChunkState::Unlocked, next, ..Header::UNUSED };

        if link_into_chain {
            self.chain = Some(h);
        }

        Some(h)
    }

    /// Marks `h` unused and pushes it onto the free-record chain.
    ///
    /// The chain link is left untouched; unlinking is the caller's business.
    pub(crate) fn release(&mut self, h: Handle) {
        let free_records = self.free_records;
        let header = self.get_mut(h);
        debug_assert!(!header.is_unused(), "{:?} released twice", h);

        header.addr = UNSET;
        header.size = 0;
        header.state = ChunkState::Free;
        header.next_unused = free_records;
        self.free_records = Some(h);
    }

    /// Drops trailing unused records, handing their space back to the region,
    /// and rebuilds the free-record chain from what remains.
    pub(crate) fn shrink(&mut self) -> usize {
        let before = self.slab.len();
        while self.slab.last().is_some_and(Header::is_unused) {
            self.slab.pop();
        }
        let popped = before - self.slab.len();

        if popped != 0 {
            self.free_records = None;
            for index in (0..self.slab.len()).rev() {
                if self.slab[index].is_unused() {
                    self.slab[index].next_unused = self.free_records;
                    self.free_records = Handle::from_index(index);
                }
            }
            log::debug!("header table shrunk by {} records to {} bytes", popped, self.footprint());
        }

        popped
    }

    /// Iterates the free-record chain, giving up after `capacity` steps.
    pub(crate) fn free_records(&self) -> impl Iterator<Item = Handle> + '_ {
        let mut current = self.free_records;
        core::iter::from_fn(move || {
            let h = current?;
            current = self.slab.get(h.index()).and_then(|header| header.next_unused);
            Some(h)
        })
        .take(self.slab.len() + 1)
    }
}

impl<A: Allocator> Chain for HeaderTable<A> {
    type Link = Handle;

    #[inline]
    fn next(&self, link: Handle) -> Option<Handle> {
        self.get(link).next
    }

    #[inline]
    fn set_next(&mut self, link: Handle, next: Option<Handle>) {
        self.get_mut(link).next = next;
    }
}

#[cfg(test)]
mod tests {
    use allocator_api2::alloc::Global;

    use super::*;

    #[test]
    fn handle_roundtrip_through_words() {
        let h = Handle::from_index(41).unwrap();
        assert_eq!(h.index(), 41);
        assert_eq!(Handle::from_word(Handle::to_word(Some(h))), Some(h));
        assert_eq!(Handle::from_word(Handle::to_word(None)), None);
    }

    #[test]
    fn carve_respects_floor_and_reserve() {
        let high = HEADER_SIZE * 10;
        let mut table = HeaderTable::new_in(high, Global);

        // room for exactly 10 records above offset 0; each carve keeps 2 in reserve
        let mut carved = 0;
        while table.allocate(true, 0, RESERVED_HEADERS).is_some() {
            carved += 1;
        }
        assert_eq!(carved, 8);
        assert_eq!(table.low(), HEADER_SIZE * 2);

        // the compactor may dip into the reserve
        assert!(table.allocate(false, 0, 0).is_some());
        assert!(table.allocate(false, 0, 0).is_some());
        assert!(table.allocate(false, 0, 0).is_none());
    }

    #[test]
    fn release_recycles_lifo() {
        let mut table = HeaderTable::new_in(HEADER_SIZE * 64, Global);

        let a = table.allocate(true, 0, RESERVED_HEADERS).unwrap();
        let b = table.allocate(true, 0, RESERVED_HEADERS).unwrap();
        for h in [a, b] {
            table.get_mut(h).addr = 0;
        }
        assert_eq!(table.chain, Some(b));
        assert_eq!(table.next(b), Some(a));

        table.release(a);
        table.release(b);
        assert!(table.get(a).is_unused());
        // chain links are untouched by release
        assert_eq!(table.next(b), Some(a));
        assert_eq!(table.free_records().collect::<std::vec::Vec<_>>(), [b, a]);

        assert_eq!(table.allocate(false, 0, RESERVED_HEADERS), Some(b));
        assert_eq!(table.allocate(false, 0, RESERVED_HEADERS), Some(a));
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn shrink_pops_trailing_unused() {
        let mut table = HeaderTable::new_in(HEADER_SIZE * 64, Global);

        let hs: std::vec::Vec<Handle> =
            (0..4).map(|_| table.allocate(false, 0, RESERVED_HEADERS).unwrap()).collect();
        for &h in &hs {
            table.get_mut(h).addr = 0;
        }

        table.release(hs[0]);
        table.release(hs[3]);
        table.release(hs[2]);

        // hs[1] is still in use, so only the two records above it go
        assert_eq!(table.shrink(), 2);
        assert_eq!(table.capacity(), 2);
        assert_eq!(table.free_records().collect::<std::vec::Vec<_>>(), [hs[0]]);
        assert_eq!(table.low(), HEADER_SIZE * 62);

        // the rebuilt free-record chain recycles hs[0] before carving
        assert_eq!(table.allocate(false, 0, RESERVED_HEADERS), Some(hs[0]));
        assert_eq!(table.capacity(), 2);
        assert!(!table.has_free_record());
    }
}
