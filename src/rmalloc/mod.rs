mod compact;
mod stats;
mod verify;

#[cfg(feature = "counters")]
pub mod counters;

pub use compact::CompactionReport;
pub use stats::{BlockCounts, LayoutMap};

use core::ptr::NonNull;

use allocator_api2::alloc::{Allocator, Global};

use crate::{
    arena::{Region, TRAILER_SIZE},
    bins::SizeClasses,
    error::{fatal, InitError, InvariantViolation, Misuse, OutOfMemory},
    header::{ChunkState, Handle, HeaderTable, HEADER_SIZE, RESERVED_HEADERS},
    ptr_utils::{align_up, ALIGN},
    Config, OomHandler, Placement,
};

/// The smallest region that can host one chunk alongside its header
/// and the compactor's reserve.
pub const MIN_REGION_SIZE: usize = TRAILER_SIZE + HEADER_SIZE * (1 + RESERVED_HEADERS);

/// The Rmalloc relocating allocator!
///
/// Clients hold [`Handle`]s, not addresses. A handle is resolved to an address with
/// [`lock`](Rmalloc::lock) or [`weak_lock`](Rmalloc::weak_lock), which also pins the
/// chunk, and released with [`unlock`](Rmalloc::unlock). Unpinned chunks may be slid
/// down by [`compact`](Rmalloc::compact_with), so addresses must not be retained across
/// an unlock.
///
/// Initialize with [`new`](Rmalloc::new), [`with_config`](Rmalloc::with_config) or
/// [`with_config_in`](Rmalloc::with_config_in). The region is returned to the backing
/// allocator on drop.
pub struct Rmalloc<O: OomHandler, A: Allocator + Clone = Global> {
    pub oom_handler: O,

    config: Config,
    region: Region,
    headers: HeaderTable<A>,
    classes: SizeClasses<A>,

    /// The bump-allocation high-water mark.
    memory_high: usize,
    /// The header whose chunk ends at `memory_high`, if any.
    highest: Option<Handle>,

    alloc: A,

    #[cfg(feature = "counters")]
    counters: counters::Counters,
}

// SAFETY: the region is uniquely owned; nothing hands out shared access to it
// beyond borrows of `self`
unsafe impl<O: OomHandler + Send, A: Allocator + Clone + Send> Send for Rmalloc<O, A> {}

impl<O: OomHandler, A: Allocator + Clone> core::fmt::Debug for Rmalloc<O, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rmalloc")
            .field("region", &self.region)
            .field("memory_high", &self.memory_high)
            .field("header_low", &self.headers.low())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<O: OomHandler> Rmalloc<O, Global> {
    /// Establishes an arena of `size` bytes from the global allocator.
    pub fn new(oom_handler: O, size: usize) -> Result<Self, InitError> {
        Self::with_config_in(oom_handler, size, Config::new(), Global)
    }

    pub fn with_config(oom_handler: O, size: usize, config: Config) -> Result<Self, InitError> {
        Self::with_config_in(oom_handler, size, config, Global)
    }
}

impl<O: OomHandler, A: Allocator + Clone> Rmalloc<O, A> {
    /// Establishes an arena of `size` bytes obtained from `alloc`.
    ///
    /// `size` is rounded down to word alignment.
    pub fn with_config_in(oom_handler: O, size: usize, config: Config, alloc: A) -> Result<Self, InitError> {
        let size = size & !(ALIGN - 1);

        if size < MIN_REGION_SIZE {
            return Err(InitError::RegionTooSmall { size, min: MIN_REGION_SIZE });
        }
        if size > isize::MAX as usize {
            return Err(InitError::RegionTooLarge(size));
        }

        let region = Region::allocate_in(size, &alloc).ok_or(InitError::AllocFailed)?;
        log::debug!("established {:?} with {:?}", region, config);

        Ok(Self {
            oom_handler,
            config,
            region,
            headers: HeaderTable::new_in(size, alloc.clone()),
            classes: SizeClasses::new_in(size, alloc.clone()),
            memory_high: 0,
            highest: None,
            alloc,
            #[cfg(feature = "counters")]
            counters: counters::Counters::new(),
        })
    }

    /// Tears the arena down, returning the region to the backing allocator.
    ///
    /// Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// Wrap in `Rmlock`, a mutex-locked wrapper struct using [`lock_api`].
    ///
    /// # Examples
    /// ```
    /// # use rmalloc::*;
    /// let rmlock = Rmalloc::new(ErrOnOom, 4096).unwrap().into_rmlock::<spin::Mutex<()>>();
    /// let h = rmlock.rmalloc().allocate(64).unwrap();
    /// rmlock.rmalloc().free(h);
    /// ```
    #[cfg(feature = "lock_api")]
    pub const fn into_rmlock<R: lock_api::RawMutex>(self) -> crate::Rmlock<R, O, A> {
        crate::Rmlock::new(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pointer to offset zero of the region.
    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    pub fn region_size(&self) -> usize {
        self.region.size()
    }

    /// The bump-allocation high-water mark, as a region offset.
    pub fn memory_high(&self) -> usize {
        self.memory_high
    }

    /// The lowest region offset occupied by the header table.
    pub fn header_low(&self) -> usize {
        self.headers.low()
    }

    /// Allocates a chunk of at least `size` bytes.
    ///
    /// The size is rounded up to word alignment and to at least the size of a
    /// free-chunk trailer record. The new chunk is Unlocked.
    pub fn allocate(&mut self, size: usize) -> Result<Handle, OutOfMemory> {
        let Some(size) = align_up(size).map(|size| size.max(TRAILER_SIZE)) else {
            log::warn!("allocation of {} bytes overflows", size);
            return Err(OutOfMemory);
        };

        loop {
            if let Some(h) = self.try_allocate(size) {
                #[cfg(feature = "counters")]
                self.counters.account_alloc(self.headers.get(h).size);

                log::trace!("allocated {} bytes as {:?} at {:#x}", size, h, self.headers.get(h).addr);
                self.scan_for_errors();
                return Ok(h);
            }

            if O::handle_oom(self, size).is_err() {
                #[cfg(feature = "counters")]
                self.counters.account_oom();

                log::warn!("out of memory allocating {} bytes", size);
                return Err(OutOfMemory);
            }
        }
    }

    fn try_allocate(&mut self, size: usize) -> Option<Handle> {
        match self.config.placement {
            Placement::ReuseFirst => self.reuse(size).or_else(|| self.bump(size)),
            Placement::BumpFirst => self.bump(size).or_else(|| self.reuse(size)),
        }
    }

    /// Carves a chunk from the top of the allocated range.
    fn bump(&mut self, size: usize) -> Option<Handle> {
        let header_cost = if self.headers.has_free_record() { 0 } else { HEADER_SIZE };
        let needed = self
            .memory_high
            .checked_add(size)?
            .checked_add(header_cost + HEADER_SIZE * RESERVED_HEADERS)?;

        if needed > self.headers.low() {
            return None;
        }

        let acme = self.memory_high + size;
        let h = self.headers.allocate(true, acme, RESERVED_HEADERS)?;

        let header = self.headers.get_mut(h);
        header.addr = self.memory_high;
        header.size = size;

        self.memory_high = acme;
        self.highest = Some(h);
        Some(h)
    }

    /// Takes a reclaimed chunk from the free lists, splitting off the excess.
    fn reuse(&mut self, size: usize) -> Option<Handle> {
        let h = match self.classes.find(&self.region, &self.headers, size) {
            Ok(found) => found?,
            Err(violation) => {
                fatal(violation);
                return None;
            }
        };

        let header = self.headers.get_mut(h);
        header.state = ChunkState::Unlocked;
        let (addr, chunk_size, next) = (header.addr, header.size, header.next);

        #[cfg(feature = "counters")]
        self.counters.account_reuse(chunk_size);

        let leftover = chunk_size - size;
        if leftover >= TRAILER_SIZE {
            // an unsplit chunk is merely internal fragmentation,
            // so don't dip into the compactor's reserve for this
            if let Some(rest) = self.headers.allocate(false, self.memory_high, RESERVED_HEADERS) {
                let rest_header = self.headers.get_mut(rest);
                rest_header.addr = addr + size;
                rest_header.size = leftover;
                rest_header.state = ChunkState::Free;
                rest_header.next = next;

                let header = self.headers.get_mut(h);
                header.size = size;
                header.next = Some(rest);

                self.classes.insert(&self.region, &self.headers, rest);

                if self.highest == Some(h) {
                    self.highest = Some(rest);
                }
            }
        }

        Some(h)
    }

    /// Frees the chunk described by `h`, handing it to the free lists.
    ///
    /// Freeing an already Free chunk does nothing. The handle may be reused
    /// for another allocation after the next compaction.
    pub fn free(&mut self, h: Handle) {
        let Some(header) = self.headers.live(h) else {
            debug_assert!(false, "free of dangling {:?}", h);
            log::warn!("ignoring free of dangling {:?}", h);
            return;
        };

        if header.state.is_free() {
            return;
        }

        let (addr, size, acme) = (header.addr, header.size, header.end());
        if acme > self.memory_high || self.memory_high > self.headers.low() {
            fatal(InvariantViolation::OutOfBounds(acme));
            return;
        }

        if let Some(byte) = self.config.poison {
            self.region.fill(addr, size - TRAILER_SIZE, byte);
        }

        self.headers.get_mut(h).state = ChunkState::Free;
        self.classes.insert(&self.region, &self.headers, h);

        #[cfg(feature = "counters")]
        self.counters.account_free(size);

        log::trace!("freed {:?}, {} bytes at {:#x}", h, size, addr);
        self.scan_for_errors();
    }

    /// Pins the chunk against compaction and returns its address.
    ///
    /// The address is valid until the matching [`unlock`](Rmalloc::unlock).
    pub fn lock(&mut self, h: Handle) -> NonNull<u8> {
        self.pin(h, ChunkState::Locked)
    }

    /// Pins the chunk like [`lock`](Rmalloc::lock), marking it as a soft pin
    /// for the caller's bookkeeping. The compactor treats both alike.
    pub fn weak_lock(&mut self, h: Handle) -> NonNull<u8> {
        self.pin(h, ChunkState::WeakLocked)
    }

    /// Releases a pin, permitting the chunk to move on the next compaction.
    pub fn unlock(&mut self, h: Handle) {
        match self.headers.live(h).map(|header| header.state) {
            Some(ChunkState::Free) => {
                debug_assert!(false, "unlock of free {:?}", h);
                log::warn!("ignoring unlock of free {:?}", h);
            }
            Some(_) => self.headers.get_mut(h).state = ChunkState::Unlocked,
            None => {
                debug_assert!(false, "unlock of dangling {:?}", h);
                log::warn!("ignoring unlock of dangling {:?}", h);
            }
        }
    }

    fn pin(&mut self, h: Handle, state: ChunkState) -> NonNull<u8> {
        let Some(header) = self.headers.live(h) else {
            debug_assert!(false, "lock of dangling {:?}", h);
            log::error!("lock of dangling {:?}", h);
            return NonNull::dangling();
        };

        let addr = header.addr;
        if header.state.is_free() {
            // pinning would let the caller clobber the trailer record
            debug_assert!(false, "lock of free {:?}", h);
            log::warn!("lock of free {:?} leaves it free", h);
        } else {
            self.headers.get_mut(h).state = state;
            log::trace!("{:?} pinned as {:?} at {:#x}", h, state, addr);
        }

        self.region.ptr(addr)
    }

    fn check(&self, h: Handle) -> Result<ChunkState, Misuse> {
        match self.headers.live(h) {
            Some(header) if header.state.is_free() => Err(Misuse::WrongState { handle: h, state: header.state }),
            Some(header) => Ok(header.state),
            None => Err(Misuse::Dangling(h)),
        }
    }

    /// [`free`](Rmalloc::free), rejecting dangling handles and double frees.
    pub fn try_free(&mut self, h: Handle) -> Result<(), Misuse> {
        self.check(h)?;
        self.free(h);
        Ok(())
    }

    /// [`lock`](Rmalloc::lock), rejecting dangling handles and Free chunks.
    pub fn try_lock(&mut self, h: Handle) -> Result<NonNull<u8>, Misuse> {
        self.check(h)?;
        Ok(self.lock(h))
    }

    /// [`weak_lock`](Rmalloc::weak_lock), rejecting dangling handles and Free chunks.
    pub fn try_weak_lock(&mut self, h: Handle) -> Result<NonNull<u8>, Misuse> {
        self.check(h)?;
        Ok(self.weak_lock(h))
    }

    /// [`unlock`](Rmalloc::unlock), rejecting dangling handles and Free chunks.
    pub fn try_unlock(&mut self, h: Handle) -> Result<(), Misuse> {
        self.check(h)?;
        self.unlock(h);
        Ok(())
    }

    /// The state of the chunk `h` describes, or `None` if it is dangling.
    pub fn state(&self, h: Handle) -> Option<ChunkState> {
        self.headers.live(h).map(|header| header.state)
    }

    /// The current region offset of the chunk `h` describes.
    ///
    /// Unless the chunk is pinned, this changes across compactions.
    pub fn offset(&self, h: Handle) -> Option<usize> {
        self.headers.live(h).map(|header| header.addr)
    }

    /// The size of the chunk `h` describes, possibly larger than requested.
    pub fn size(&self, h: Handle) -> Option<usize> {
        self.headers.live(h).map(|header| header.size)
    }

    /// Views the contents of an in-use chunk.
    pub fn chunk(&self, h: Handle) -> Option<&[u8]> {
        let header = self.headers.live(h).filter(|header| !header.state.is_free())?;
        // SAFETY: the slice borrows the arena, so nothing can move or free it meanwhile
        Some(unsafe { self.region.slice(header.addr, header.size) })
    }

    /// Mutably views the contents of an in-use chunk.
    pub fn chunk_mut(&mut self, h: Handle) -> Option<&mut [u8]> {
        let header = self.headers.live(h).filter(|header| !header.state.is_free())?;
        // SAFETY: as above, and the borrow is unique
        Some(unsafe { self.region.slice_mut(header.addr, header.size) })
    }

    #[cfg(not(debug_assertions))]
    fn scan_for_errors(&self) {}

    #[cfg(debug_assertions)]
    /// Debugging function for checking various assumptions.
    fn scan_for_errors(&self) {
        if let Err(violation) = self.verify() {
            panic!("rmalloc invariant violated: {}\n{}", violation, self.layout_map());
        }
    }
}

impl<O: OomHandler, A: Allocator + Clone> Drop for Rmalloc<O, A> {
    fn drop(&mut self) {
        log::debug!("releasing {:?}", self.region);
        // SAFETY: the region came from `self.alloc` and dies with `self`
        unsafe { self.region.deallocate_in(&self.alloc) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrOnOom;

    #[test]
    fn rejects_tiny_region() {
        assert_eq!(
            Rmalloc::new(ErrOnOom, 8).unwrap_err(),
            InitError::RegionTooSmall { size: 8, min: MIN_REGION_SIZE },
        );
        assert!(Rmalloc::new(ErrOnOom, MIN_REGION_SIZE).is_ok());
    }

    #[test]
    fn rounds_requests_up() {
        let mut rm = Rmalloc::new(ErrOnOom, 4096).unwrap();

        let a = rm.allocate(0).unwrap();
        let b = rm.allocate(TRAILER_SIZE + 1).unwrap();
        assert_eq!(rm.size(a), Some(TRAILER_SIZE));
        assert_eq!(rm.size(b), Some(TRAILER_SIZE + ALIGN));
        assert_eq!(rm.offset(a), Some(0));
        assert_eq!(rm.offset(b), Some(TRAILER_SIZE));
        assert!(rm.allocate(usize::MAX).is_err());
    }

    #[test]
    fn reuse_splits_off_suffix() {
        let mut rm = Rmalloc::new(ErrOnOom, 1 << 16).unwrap();

        let a = rm.allocate(256).unwrap();
        let _b = rm.allocate(64).unwrap();
        rm.free(a);

        let c = rm.allocate(64).unwrap();
        assert_eq!(rm.offset(c), Some(0));
        assert_eq!(rm.size(c), Some(64));

        // the remaining 192 bytes are free and reusable in place
        let d = rm.allocate(192).unwrap();
        assert_eq!(rm.offset(d), Some(64));
        assert_eq!(rm.memory_high(), 320);
    }

    #[test]
    fn small_leftover_stays_in_chunk() {
        let mut rm = Rmalloc::new(ErrOnOom, 1 << 16).unwrap();

        let a = rm.allocate(TRAILER_SIZE + ALIGN).unwrap();
        let _b = rm.allocate(64).unwrap();
        rm.free(a);

        let c = rm.allocate(TRAILER_SIZE).unwrap();
        assert_eq!(rm.offset(c), Some(0));
        assert_eq!(rm.size(c), Some(TRAILER_SIZE + ALIGN));
    }

    #[test]
    fn bump_first_prefers_fresh_memory() {
        let config = Config::new().with_placement(Placement::BumpFirst);
        let mut rm = Rmalloc::with_config(ErrOnOom, 1 << 16, config).unwrap();

        let a = rm.allocate(128).unwrap();
        rm.free(a);
        let b = rm.allocate(128).unwrap();
        assert_eq!(rm.offset(b), Some(128));
    }

    #[test]
    fn pin_states() {
        let mut rm = Rmalloc::new(ErrOnOom, 4096).unwrap();
        let h = rm.allocate(32).unwrap();
        assert_eq!(rm.state(h), Some(ChunkState::Unlocked));

        let ptr = rm.lock(h);
        assert_eq!(ptr.as_ptr(), rm.base().as_ptr().wrapping_add(rm.offset(h).unwrap()));
        assert_eq!(rm.state(h), Some(ChunkState::Locked));

        rm.unlock(h);
        rm.weak_lock(h);
        assert_eq!(rm.state(h), Some(ChunkState::WeakLocked));
        rm.unlock(h);
        assert_eq!(rm.state(h), Some(ChunkState::Unlocked));

        rm.free(h);
        assert_eq!(rm.state(h), Some(ChunkState::Free));
        rm.free(h);
        assert_eq!(rm.state(h), Some(ChunkState::Free));
    }

    #[test]
    fn checked_operations() {
        let mut rm = Rmalloc::new(ErrOnOom, 4096).unwrap();
        let h = rm.allocate(32).unwrap();

        assert!(rm.try_lock(h).is_ok());
        assert!(rm.try_unlock(h).is_ok());
        assert!(rm.try_free(h).is_ok());

        assert_eq!(rm.try_free(h), Err(Misuse::WrongState { handle: h, state: ChunkState::Free }));
        assert_eq!(rm.try_lock(h), Err(Misuse::WrongState { handle: h, state: ChunkState::Free }));
        assert!(rm.try_unlock(h).is_err());

        let dangling = Handle::from_index(999).unwrap();
        assert_eq!(rm.try_weak_lock(dangling), Err(Misuse::Dangling(dangling)));
        assert_eq!(rm.state(dangling), None);
    }

    #[test]
    fn chunk_access_and_poison() {
        let config = Config::new().with_poison(0xee);
        let mut rm = Rmalloc::with_config(ErrOnOom, 4096, config).unwrap();

        let h = rm.allocate(64).unwrap();
        rm.chunk_mut(h).unwrap().fill(7);
        assert!(rm.chunk(h).unwrap().iter().all(|&b| b == 7));

        let addr = rm.offset(h).unwrap();
        rm.free(h);
        assert!(rm.chunk(h).is_none());

        let bytes = unsafe { core::slice::from_raw_parts(rm.base().as_ptr().add(addr), 64 - TRAILER_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0xee));
    }
}
