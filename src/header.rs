//! Block headers and the block handle.
//!
//! Every heap allocation is preceded by a two-word header:
//!
//! ```text
//! | len | tags |  magic ^ (len | tags)  |  user data ...
//! ^ base                               ^ user pointer
//! ```
//!
//! `len` is the physical block length, header included. Since it is a
//! multiple of [`ALIGN`], its low bits carry tags. When the block is freed the
//! second word becomes [`FREED`], and while it sits in the freelist its first
//! word is its quantized size.

use core::{fmt, ptr::NonNull};

use crate::quantize::ALIGN;

pub const HEADER_SIZE: usize = ALIGN;

const MAGIC: usize = 0xA110_CA7E_D0D0_B10Cu64 as usize;
const FREED: usize = 0xF4EE_F4EE_F4EE_F4EEu64 as usize;

pub(crate) const TAG_MASK: usize = ALIGN - 1;
/// The block lives in the bootstrap heap.
pub(crate) const TAG_BOOT: usize = 0b1;

/// What was wrong with a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderError {
    DoubleFree,
    Corrupt { word: usize, check: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::DoubleFree => write!(f, "block freed twice"),
            HeaderError::Corrupt { word, check } => {
                write!(f, "corrupted header (len word {:#x}, check word {:#x})", word, check)
            }
        }
    }
}

/// A block of heap memory: base address and physical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    base: NonNull<u8>,
    len: usize,
}

impl BlockHandle {
    /// # Safety
    /// `base` must be [`ALIGN`]-aligned, and `base..base + len` owned by the caller.
    #[inline]
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!(base.as_ptr() as usize % ALIGN == 0);
        debug_assert!(len % ALIGN == 0 && len != 0);
        Self { base, len }
    }

    /// # Safety
    /// See [`BlockHandle::new`]. `base` must not be zero.
    #[inline]
    pub unsafe fn from_addr(base: usize, len: usize) -> Self {
        Self::new(NonNull::new_unchecked(base as *mut u8), len)
    }

    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub fn end(self) -> usize {
        self.addr() + self.len
    }

    #[inline]
    pub fn user_ptr(self) -> NonNull<u8> {
        // SAFETY: the header lies within the block
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(HEADER_SIZE)) }
    }

    /// Bytes usable by the client.
    #[inline]
    pub fn usable(self) -> usize {
        self.len - HEADER_SIZE
    }

    /// Splits off everything past the first `len` bytes.
    #[inline]
    pub fn split(self, len: usize) -> (Self, Option<Self>) {
        debug_assert!(len <= self.len);
        let head = Self { base: self.base, len };
        let tail = (len < self.len).then(|| unsafe {
            Self::from_addr(self.addr() + len, self.len - len)
        });
        (head, tail)
    }

    /// Reads and validates the header in front of `user`.
    ///
    /// # Safety
    /// `user` must point [`HEADER_SIZE`] bytes into readable memory.
    pub unsafe fn from_user(user: NonNull<u8>) -> Result<(Self, usize), HeaderError> {
        let words = user.as_ptr().sub(HEADER_SIZE).cast::<usize>();
        let word = words.read();
        let check = words.add(1).read();

        if check == FREED {
            return Err(HeaderError::DoubleFree);
        }
        let len = word & !TAG_MASK;
        if check != MAGIC ^ word || len == 0 {
            return Err(HeaderError::Corrupt { word, check });
        }

        Ok((Self::from_addr(words as usize, len), word & TAG_MASK))
    }

    /// Writes an allocated-block header with `tags`.
    ///
    /// # Safety
    /// The block must be owned by the caller.
    #[inline]
    pub unsafe fn write_header(self, tags: usize) {
        debug_assert!(tags & !TAG_MASK == 0);
        let words = self.base.as_ptr().cast::<usize>();
        let word = self.len | tags;
        words.write(word);
        words.add(1).write(MAGIC ^ word);
    }

    /// Marks the header as freed, so a second free is caught.
    ///
    /// # Safety
    /// The block must be owned by the caller.
    #[inline]
    pub unsafe fn mark_freed(self) {
        self.base.as_ptr().cast::<usize>().add(1).write(FREED);
    }

    /// Writes the freelist size tag.
    ///
    /// # Safety
    /// The block must be owned by the caller.
    #[inline]
    pub unsafe fn write_free_tag(self) {
        self.base.as_ptr().cast::<usize>().write(self.len);
    }

    /// Reads the freelist size tag of the free block at `addr`.
    ///
    /// # Safety
    /// `addr` must be a free block.
    #[inline]
    pub unsafe fn read_free_tag(addr: usize) -> usize {
        (addr as *const usize).read()
    }
}

unsafe impl Send for BlockHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Buf([u8; 256]);

    #[test]
    fn header_round_trip() {
        let mut buf = Buf([0; 256]);
        let base = NonNull::new(buf.0.as_mut_ptr()).unwrap();

        let block = unsafe { BlockHandle::new(base, 128) };
        unsafe { block.write_header(TAG_BOOT) };

        let (read, tags) = unsafe { BlockHandle::from_user(block.user_ptr()) }.unwrap();
        assert_eq!(read, block);
        assert_eq!(tags, TAG_BOOT);
        assert_eq!(read.usable(), 128 - HEADER_SIZE);

        unsafe { block.mark_freed() };
        assert_eq!(unsafe { BlockHandle::from_user(block.user_ptr()) }, Err(HeaderError::DoubleFree));
    }

    #[test]
    fn corrupt_header_is_caught() {
        let mut buf = Buf([0; 256]);
        let base = NonNull::new(buf.0.as_mut_ptr()).unwrap();

        let block = unsafe { BlockHandle::new(base, 64) };
        unsafe { block.write_header(0) };
        buf.0[0] = 0x70;

        assert!(matches!(
            unsafe { BlockHandle::from_user(block.user_ptr()) },
            Err(HeaderError::Corrupt { .. })
        ));
    }

    #[test]
    fn split_blocks() {
        let mut buf = Buf([0; 256]);
        let base = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let block = unsafe { BlockHandle::new(base, 256) };

        let (head, tail) = block.split(64);
        assert_eq!(head.len(), 64);
        let tail = tail.unwrap();
        assert_eq!(tail.addr(), block.addr() + 64);
        assert_eq!(tail.end(), block.end());
        assert_eq!(block.split(256).1, None);
    }
}
