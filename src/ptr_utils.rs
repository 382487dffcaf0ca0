//! Generic utilities for sizing and offset handling.

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
pub const ALIGN: usize = core::mem::align_of::<usize>();

/// Aligns `size` up to the next multiple of `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one. Returns `None` on overflow.
#[inline]
pub fn align_up_by(size: usize, align_mask: usize) -> Option<usize> {
    debug_assert!((align_mask + 1).is_power_of_two());

    Some(size.checked_add(align_mask)? & !align_mask)
}

/// Aligns `size` up to natural word alignment.
#[inline]
pub fn align_up(size: usize) -> Option<usize> {
    align_up_by(size, ALIGN - 1)
}

/// Floor of the base-two logarithm. `size` must be nonzero.
#[inline]
pub fn log2(size: usize) -> usize {
    debug_assert!(size != 0);
    size.ilog2() as usize
}

/// Ceiling of the base-two logarithm. `size` must be nonzero.
#[inline]
pub fn ceil_log2(size: usize) -> usize {
    debug_assert!(size != 0);
    if size == 1 {
        0
    } else {
        (size - 1).ilog2() as usize + 1
    }
}
