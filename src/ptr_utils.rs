//! Generic utilities for address handling and sizing.

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Aligns `addr` up to the next multiple of `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub const fn align_up_by(addr: usize, align_mask: usize) -> usize {
    debug_assert!((align_mask.wrapping_add(1)).is_power_of_two());

    addr.wrapping_add(align_mask) & !align_mask
}

/// Aligns `addr` down to a multiple of `align_mask + 1`.
#[inline]
pub const fn align_down_by(addr: usize, align_mask: usize) -> usize {
    debug_assert!((align_mask.wrapping_add(1)).is_power_of_two());

    addr & !align_mask
}

#[inline]
pub fn is_aligned_to(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}
