use core::{alloc::Layout, ptr::NonNull};

use allocator_api2::alloc::Allocator;

use crate::ptr_utils::{ALIGN, WORD_SIZE};

/// The contiguous byte region an [`Rmalloc`](crate::Rmalloc) carves chunks out of.
///
/// # Layout
///
/// ```not_rust
/// ├──────────────────────────Region─────────────────────────────┤
/// ┬───────────┬──────┬───────────┬─────────────┬────────────────┬
/// | Unlocked  | Free | Locked    | (unused)    | Header table   |
/// ┴───────────┴──────┴───────────┴─────────────┴────────────────┴
/// ├ 0                            ├ memory_high ├ header_low     ┤ size
/// ```
///
/// Chunks grow upward from offset zero; the header table grows downward from
/// the end. All offsets handed around the crate are relative to `base`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Region {
    base: NonNull<u8>,
    size: usize,
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Region({:p}..[{}])", self.base, self.size)
    }
}

/// Free-chunk trailer record, written into the last bytes of a Free chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trailer {
    /// Packed handle of the header owning the chunk.
    pub(crate) owner: usize,
    /// Packed handle of the next chunk in the same size class.
    pub(crate) next: usize,
}

/// Bytes a trailer record occupies, and so the minimum chunk size.
pub(crate) const TRAILER_SIZE: usize = 2 * WORD_SIZE;

impl Region {
    pub(crate) fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, ALIGN).ok()
    }

    /// Obtains a zeroed region of `size` bytes from `alloc`.
    pub(crate) fn allocate_in<A: Allocator>(size: usize, alloc: &A) -> Option<Self> {
        let layout = Self::layout(size)?;
        let slice = alloc.allocate_zeroed(layout).ok()?;
        Some(Self { base: slice.cast(), size })
    }

    /// Returns the region to `alloc`.
    ///
    /// # Safety
    /// The region must have been obtained from `alloc` by [`Region::allocate_in`]
    /// and must not be used afterwards.
    pub(crate) unsafe fn deallocate_in<A: Allocator>(self, alloc: &A) {
        if let Some(layout) = Self::layout(self.size) {
            alloc.deallocate(self.base, layout);
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "{:#x}+{} out of {:?}", offset, len, self
        );
    }

    /// Pointer to the byte at `offset`.
    #[inline]
    pub(crate) fn ptr(&self, offset: usize) -> NonNull<u8> {
        self.check(offset, 0);
        // SAFETY: offset is within the allocation
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Reads the trailer record of the chunk ending at `acme`.
    pub(crate) fn read_trailer(&self, acme: usize) -> Trailer {
        let at = acme - TRAILER_SIZE;
        self.check(at, TRAILER_SIZE);
        // SAFETY: bounds checked above; the region is plain bytes
        unsafe {
            let ptr = self.base.as_ptr().add(at).cast::<usize>();
            Trailer { owner: ptr.read_unaligned(), next: ptr.add(1).read_unaligned() }
        }
    }

    /// Writes the trailer record of the chunk ending at `acme`.
    pub(crate) fn write_trailer(&self, acme: usize, trailer: Trailer) {
        let at = acme - TRAILER_SIZE;
        self.check(at, TRAILER_SIZE);
        // SAFETY: bounds checked above; the region is plain bytes
        unsafe {
            let ptr = self.base.as_ptr().add(at).cast::<usize>();
            ptr.write_unaligned(trailer.owner);
            ptr.add(1).write_unaligned(trailer.next);
        }
    }

    /// Rewrites only the `next` link of the trailer of the chunk ending at `acme`.
    pub(crate) fn write_trailer_next(&self, acme: usize, next: usize) {
        let trailer = self.read_trailer(acme);
        self.write_trailer(acme, Trailer { next, ..trailer });
    }

    /// Copies `len` bytes from `src` down to `dst`; the ranges may overlap.
    pub(crate) fn copy_within(&self, src: usize, dst: usize, len: usize) {
        self.check(src, len);
        self.check(dst, len);
        // SAFETY: both ranges are within the allocation; `copy` handles overlap
        unsafe {
            core::ptr::copy(self.base.as_ptr().add(src), self.base.as_ptr().add(dst), len);
        }
    }

    /// Fills `len` bytes at `offset` with `byte`.
    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) {
        self.check(offset, len);
        // SAFETY: bounds checked above
        unsafe { self.base.as_ptr().add(offset).write_bytes(byte, len) }
    }

    /// Views `len` bytes at `offset`.
    ///
    /// # Safety
    /// No mutable access to the same bytes may happen while the slice lives.
    pub(crate) unsafe fn slice<'a>(&self, offset: usize, len: usize) -> &'a [u8] {
        self.check(offset, len);
        core::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
    }

    /// Mutably views `len` bytes at `offset`.
    ///
    /// # Safety
    /// No other access to the same bytes may happen while the slice lives.
    pub(crate) unsafe fn slice_mut<'a>(&self, offset: usize, len: usize) -> &'a mut [u8] {
        self.check(offset, len);
        core::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len)
    }
}

#[cfg(test)]
mod tests {
    use allocator_api2::alloc::Global;

    use super::*;

    #[test]
    fn trailer_roundtrip_and_copy() {
        let region = Region::allocate_in(256, &Global).unwrap();
        assert_eq!(region.size(), 256);
        assert!(region.base().as_ptr() as usize % ALIGN == 0);

        region.write_trailer(64, Trailer { owner: 3, next: 9 });
        assert_eq!(region.read_trailer(64), Trailer { owner: 3, next: 9 });
        region.write_trailer_next(64, 0);
        assert_eq!(region.read_trailer(64), Trailer { owner: 3, next: 0 });

        region.fill(100, 10, 0xab);
        region.copy_within(100, 95, 10);
        let bytes = unsafe { region.slice(95, 15) };
        assert!(bytes[..10].iter().all(|&b| b == 0xab));
        assert!(bytes[10..].iter().all(|&b| b == 0xab));

        unsafe { region.deallocate_in(&Global) };
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_trailer_panics() {
        let region = Region::allocate_in(64, &Global).unwrap();
        region.read_trailer(72);
    }
}
