//! Segregated free lists, one per power-of-two size class.
//!
//! Class `k` holds Free chunks with sizes in `2^k..2^(k+1)`. The lists are
//! threaded through the trailer records at the tail of each Free chunk, so
//! filing a chunk costs no metadata beyond its header.

use allocator_api2::{alloc::Allocator, vec::Vec};

use crate::{
    arena::{Region, Trailer},
    error::InvariantViolation,
    header::{Handle, HeaderTable},
    ptr_utils::{ceil_log2, log2},
};

pub(crate) struct SizeClasses<A: Allocator> {
    slots: Vec<Option<Handle>, A>,
}

impl<A: Allocator> SizeClasses<A> {
    /// Creates enough classes to file any chunk of a `region_size` region.
    pub(crate) fn new_in(region_size: usize, alloc: A) -> Self {
        let count = ceil_log2(region_size) + 1;
        let mut slots = Vec::with_capacity_in(count, alloc);
        slots.resize(count, None);
        Self { slots }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.slots.len()
    }

    /// The class a chunk of `size` bytes is filed under.
    #[inline]
    pub(crate) fn class_of(&self, size: usize) -> usize {
        log2(size).min(self.slots.len() - 1)
    }

    /// Files the Free chunk described by `h` under its exact class,
    /// writing its trailer record.
    pub(crate) fn insert<B: Allocator>(&mut self, region: &Region, headers: &HeaderTable<B>, h: Handle) {
        let header = headers.get(h);
        debug_assert!(header.state.is_free());

        let class = self.class_of(header.size);
        region.write_trailer(
            header.end(),
            Trailer { owner: Handle::to_word(Some(h)), next: Handle::to_word(self.slots[class]) },
        );
        self.slots[class] = Some(h);
    }

    /// Reads the class link out of `h`'s trailer, checking the back-reference.
    fn next_of<B: Allocator>(
        region: &Region,
        headers: &HeaderTable<B>,
        h: Handle,
    ) -> Result<Option<Handle>, InvariantViolation> {
        let header = headers.live(h).ok_or(InvariantViolation::TrailerMismatch(h))?;
        let trailer = region.read_trailer(header.end());

        if Handle::from_word(trailer.owner) != Some(h) {
            return Err(InvariantViolation::TrailerMismatch(h));
        }
        Ok(Handle::from_word(trailer.next))
    }

    /// Removes `h` from `class`, where `prev` is its predecessor or `None` if `h` is the head.
    fn unlink<B: Allocator>(
        &mut self,
        region: &Region,
        headers: &HeaderTable<B>,
        class: usize,
        prev: Option<Handle>,
        h: Handle,
    ) -> Result<(), InvariantViolation> {
        let next = Self::next_of(region, headers, h)?;

        match prev {
            Some(prev) => region.write_trailer_next(headers.get(prev).end(), Handle::to_word(next)),
            None => self.slots[class] = next,
        }
        Ok(())
    }

    /// Pops the head of `class`.
    fn pop<B: Allocator>(
        &mut self,
        region: &Region,
        headers: &HeaderTable<B>,
        class: usize,
    ) -> Result<Option<Handle>, InvariantViolation> {
        let Some(h) = self.slots[class] else { return Ok(None) };
        self.unlink(region, headers, class, None, h)?;
        Ok(Some(h))
    }

    /// Takes a Free chunk of at least `min_size` bytes out of the free lists.
    ///
    /// Classes above `min_size`'s own are guaranteed fits, so they are tried
    /// first, lowest to highest. Chunks filed lower than their size warrants
    /// are moved to their proper class on the way. Failing that, the class of
    /// `min_size` itself is scanned linearly for a fit.
    pub(crate) fn find<B: Allocator>(
        &mut self,
        region: &Region,
        headers: &HeaderTable<B>,
        min_size: usize,
    ) -> Result<Option<Handle>, InvariantViolation> {
        let natural = self.class_of(min_size);

        for class in natural + 1..self.slots.len() {
            let mut steps = 0;
            while let Some(h) = self.pop(region, headers, class)? {
                steps += 1;
                if steps > headers.capacity() {
                    return Err(InvariantViolation::CycleDetected);
                }

                let size = headers.get(h).size;
                if size < 1 << class {
                    return Err(InvariantViolation::SizeClassMismatch { class, size });
                }

                if self.class_of(size) > class {
                    log::trace!("demoting {:?} of {} bytes out of class {}", h, size, class);
                    self.insert(region, headers, h);
                    continue;
                }

                return Ok(Some(h));
            }
        }

        self.scan_class(region, headers, natural, min_size)
    }

    /// Linear first-fit scan of one class.
    fn scan_class<B: Allocator>(
        &mut self,
        region: &Region,
        headers: &HeaderTable<B>,
        class: usize,
        min_size: usize,
    ) -> Result<Option<Handle>, InvariantViolation> {
        let mut demoted = None;
        let mut prev = None;
        let mut current = self.slots[class];
        let mut steps = 0;

        while let Some(h) = current {
            steps += 1;
            if steps > headers.capacity() {
                return Err(InvariantViolation::CycleDetected);
            }

            let next = Self::next_of(region, headers, h)?;
            let size = headers.get(h).size;

            if size < 1 << class {
                return Err(InvariantViolation::SizeClassMismatch { class, size });
            }

            if self.class_of(size) > class {
                // refile it; `prev` stays put as `h` is no longer in this class
                self.unlink(region, headers, class, prev, h)?;
                self.insert(region, headers, h);
                demoted = Some(h);
            } else if size >= min_size {
                self.unlink(region, headers, class, prev, h)?;
                return Ok(Some(h));
            } else {
                prev = Some(h);
            }

            current = next;
        }

        // a refiled chunk is larger than this class, so it fits too;
        // being the most recent insert it heads its new class
        if let Some(h) = demoted {
            let true_class = self.class_of(headers.get(h).size);
            debug_assert_eq!(self.slots[true_class], Some(h));
            return self.pop(region, headers, true_class);
        }

        Ok(None)
    }

    /// Empties every class.
    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Calls `f` on every chunk filed under `class`, failing on a cycle or
    /// a broken trailer record.
    pub(crate) fn walk<B: Allocator>(
        &self,
        region: &Region,
        headers: &HeaderTable<B>,
        class: usize,
        mut f: impl FnMut(Handle),
    ) -> Result<(), InvariantViolation> {
        let mut current = self.slots[class];
        let mut steps = 0;

        while let Some(h) = current {
            steps += 1;
            if steps > headers.capacity() {
                return Err(InvariantViolation::CycleDetected);
            }

            f(h);
            current = Self::next_of(region, headers, h)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use allocator_api2::alloc::Global;

    use super::*;
    use crate::{arena::TRAILER_SIZE, header::RESERVED_HEADERS, ChunkState};

    struct Fixture {
        region: Region,
        headers: HeaderTable<Global>,
        classes: SizeClasses<Global>,
    }

    impl Fixture {
        fn new() -> Self {
            let size = 1 << 16;
            Self {
                region: Region::allocate_in(size, &Global).unwrap(),
                headers: HeaderTable::new_in(size, Global),
                classes: SizeClasses::new_in(size, Global),
            }
        }

        fn free_chunk(&mut self, addr: usize, size: usize) -> Handle {
            let h = self.headers.allocate(true, 1 << 15, RESERVED_HEADERS).unwrap();
            let header = self.headers.get_mut(h);
            header.addr = addr;
            header.size = size;
            header.state = ChunkState::Free;
            self.classes.insert(&self.region, &self.headers, h);
            h
        }

        fn find(&mut self, min: usize) -> Option<Handle> {
            self.classes.find(&self.region, &self.headers, min).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe { self.region.deallocate_in(&Global) };
        }
    }

    #[test]
    fn class_count_covers_region() {
        let classes = SizeClasses::new_in(1 << 20, Global);
        assert_eq!(classes.count(), 21);
        assert_eq!(classes.class_of(1 << 20), 20);
        assert_eq!(classes.class_of(TRAILER_SIZE), log2(TRAILER_SIZE));

        let classes = SizeClasses::new_in(1000, Global);
        assert_eq!(classes.count(), 11);
    }

    #[test]
    fn prefers_guaranteed_fit_above_exact_class() {
        let mut fx = Fixture::new();
        let small = fx.free_chunk(0, 100);
        let big = fx.free_chunk(256, 300);

        // class 6 holds 100 which fits 70, but class 7+ is tried first
        assert_eq!(fx.find(70), Some(big));
        assert_eq!(fx.find(70), Some(small));
        assert_eq!(fx.find(70), None);
    }

    #[test]
    fn falls_back_to_linear_scan_of_exact_class() {
        let mut fx = Fixture::new();
        let a = fx.free_chunk(0, 72);
        let b = fx.free_chunk(128, 96);
        let c = fx.free_chunk(256, 80);

        // all three are in class 6; only b fits 90
        assert_eq!(fx.find(90), Some(b));
        assert_eq!(fx.find(90), None);
        // LIFO among the rest
        assert_eq!(fx.find(64), Some(c));
        assert_eq!(fx.find(64), Some(a));
    }

    #[test]
    fn demotes_misfiled_chunks() {
        let mut fx = Fixture::new();
        let h = fx.free_chunk(0, 64);
        // grow the chunk behind the free list's back
        fx.headers.get_mut(h).size = 512;
        fx.region.write_trailer(512, Trailer { owner: Handle::to_word(Some(h)), next: 0 });

        assert_eq!(fx.find(32), Some(h));
        assert_eq!(fx.find(32), None);

        let h = fx.free_chunk(1024, 64);
        fx.headers.get_mut(h).size = 512;
        fx.region.write_trailer(1536, Trailer { owner: Handle::to_word(Some(h)), next: 0 });

        // exact-class scan refiles it to class 9, then hands it out
        assert_eq!(fx.find(100), Some(h));
        for class in 0..fx.classes.count() {
            assert_eq!(fx.classes.slots[class], None);
        }
    }

    #[test]
    fn detects_broken_trailer() {
        let mut fx = Fixture::new();
        let h = fx.free_chunk(0, 64);
        fx.region.fill(64 - TRAILER_SIZE, TRAILER_SIZE, 0);

        assert_eq!(
            fx.classes.find(&fx.region, &fx.headers, 16),
            Err(InvariantViolation::TrailerMismatch(h)),
        );
    }

    #[test]
    fn walk_visits_class() {
        let mut fx = Fixture::new();
        let a = fx.free_chunk(0, 40);
        let b = fx.free_chunk(64, 48);
        let mut seen = std::vec::Vec::new();
        fx.classes.walk(&fx.region, &fx.headers, 5, |h| seen.push(h)).unwrap();
        assert_eq!(seen, [b, a]);

        fx.classes.clear();
        assert_eq!(fx.classes.slots[5], None);
    }
}
