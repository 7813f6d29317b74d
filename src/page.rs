//! Page geometry: the OS page size and the rounding helpers built on it.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::ptr_utils;

/// Page size assumed until the page source has been asked.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A power-of-two page size and its derived mask and shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    size: usize,
    shift: u32,
}

impl PageGeometry {
    /// Builds the geometry for `size`.
    ///
    /// # Panics
    /// Panics if `size` is not a power of two.
    pub const fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "page size is not a power of two");
        Self { size, shift: size.trailing_zeros() }
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.size
    }

    #[inline]
    pub const fn shift(self) -> u32 {
        self.shift
    }

    #[inline]
    pub const fn mask(self) -> usize {
        self.size - 1
    }

    /// Rounds `len` up to a whole number of pages.
    #[inline]
    pub const fn round_up(self, len: usize) -> usize {
        ptr_utils::align_up_by(len, self.mask())
    }

    #[inline]
    pub const fn round_down(self, len: usize) -> usize {
        ptr_utils::align_down_by(len, self.mask())
    }

    /// Number of pages needed to hold `len` bytes.
    #[inline]
    pub const fn pages(self, len: usize) -> usize {
        self.round_up(len) >> self.shift
    }

    #[inline]
    pub const fn bytes(self, pages: usize) -> usize {
        pages << self.shift
    }

    /// Base address of the page holding `addr`.
    #[inline]
    pub const fn page_of(self, addr: usize) -> usize {
        self.round_down(addr)
    }

    #[inline]
    pub const fn is_aligned(self, addr: usize) -> bool {
        addr & self.mask() == 0
    }
}

/// Page geometry shared by one allocator instance, set once during init.
#[derive(Debug)]
pub(crate) struct SharedGeometry(AtomicUsize);

impl SharedGeometry {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(DEFAULT_PAGE_SIZE))
    }

    pub fn set(&self, geometry: PageGeometry) {
        self.0.store(geometry.size(), Ordering::Release);
    }

    #[inline]
    pub fn get(&self) -> PageGeometry {
        PageGeometry::new(self.0.load(Ordering::Acquire))
    }
}
