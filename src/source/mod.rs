//! The operating-system collaborators the allocator is built upon.
//!
//! A [`PageSource`] provides anonymous mappings, page protection,
//! page invalidation, the simple heap-extension primitive used during
//! bootstrap, and (optionally) a listing of the process's current mappings.

use core::{fmt, ptr::NonNull};

#[cfg(all(feature = "system-backed", unix))]
pub mod unix;

#[cfg(all(feature = "system-backed", unix))]
pub use unix::UnixMMapSource;

/// Page protection modes understood by [`PageSource::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

/// Failure to load the OS-provided process memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapLoadError {
    /// This source cannot describe the address space.
    Unsupported,
    /// The map exists but could not be opened or read.
    Unreadable,
    /// Line `line` of the map could not be parsed.
    Malformed { line: usize },
}

impl fmt::Display for MapLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapLoadError::Unsupported => write!(f, "process memory map not available on this platform"),
            MapLoadError::Unreadable => write!(f, "process memory map could not be read"),
            MapLoadError::Malformed { line } => {
                write!(f, "process memory map malformed at line {}", line)
            }
        }
    }
}

/// Access to the operating system's memory primitives.
///
/// # Safety
/// Implementors must not allocate through the global allocator from any of
/// these methods: the allocator built on top of them may *be* the global
/// allocator, and such a call would recurse or deadlock.
///
/// Mappings returned by [`PageSource::map`] must be page-aligned, readable,
/// writable and zero-filled.
pub unsafe trait PageSource {
    /// The OS page size. Must be a power of two.
    fn page_size(&self) -> usize;

    /// Creates an anonymous mapping of `len` bytes, preferably at `hint`.
    ///
    /// The hint may be ignored, in which case another address is returned.
    /// Returns `None` when the OS refuses to provide any more memory.
    fn map(&self, hint: Option<NonNull<u8>>, len: usize) -> Option<NonNull<u8>>;

    /// Destroys the mapping(s) covering `base..base + len`.
    ///
    /// # Safety
    /// The range must have been obtained from [`PageSource::map`] and must no longer be used.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize);

    /// Changes the protection of `base..base + len`. Returns whether it succeeded.
    ///
    /// # Safety
    /// The range must be mapped and page-aligned.
    unsafe fn protect(&self, base: NonNull<u8>, len: usize, prot: Protection) -> bool;

    /// Tells the OS that the contents of `base..base + len` are no longer needed.
    ///
    /// The range stays mapped; its contents become unspecified.
    ///
    /// # Safety
    /// The range must be mapped and page-aligned.
    unsafe fn invalidate(&self, base: NonNull<u8>, len: usize) -> bool;

    /// Moves the heap break by `increment` bytes and returns the previous break.
    ///
    /// Only used before the page layer is initialized.
    fn grow_heap(&self, increment: isize) -> Option<NonNull<u8>>;

    /// The current heap break.
    fn heap_break(&self) -> *mut u8;

    /// Reports every mapping of the process, in ascending order, as `(start, end)` pairs.
    fn load_map(&self, sink: &mut dyn FnMut(usize, usize)) -> Result<(), MapLoadError>;
}
