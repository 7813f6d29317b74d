//! Size classes.
//!
//! Block sizes are a two-segment step function: multiples of [`ALIGN`] up to
//! [`FACTOR_MAXSIZE`], multiples of [`BLOCK_SIZE`] up to [`MAXSIZE`], and
//! whole pages beyond that. Every splitting and coalescing decision goes
//! through [`quantize`], [`is_legal`] and [`falls_in_bucket`].

use crate::{page::PageGeometry, ptr_utils::WORD_SIZE};

/// Block alignment and header size.
pub const ALIGN: usize = 2 * WORD_SIZE;
/// Largest size of the fine-grained segment.
pub const FACTOR_MAXSIZE: usize = 1024;
/// Step of the coarse segment.
pub const BLOCK_SIZE: usize = 256;
/// Largest size served from the freelist. Bigger blocks are whole pages.
pub const MAXSIZE: usize = 32768;

const FACTOR_BUCKETS: usize = FACTOR_MAXSIZE / ALIGN;
const BLOCK_BUCKETS: usize = (MAXSIZE - FACTOR_MAXSIZE) / BLOCK_SIZE;

/// Number of freelist buckets.
pub const BUCKETS: usize = FACTOR_BUCKETS + BLOCK_BUCKETS;

/// Smallest leftover worth splitting off.
pub const MIN_SPLIT: usize = 2 * ALIGN;
/// A split must also leave at least `1/SPLIT_FRACTION` of the block.
pub const SPLIT_FRACTION: usize = 16;

/// Rounds `size` up to its size class.
#[inline]
pub const fn quantize(size: usize, geo: PageGeometry) -> usize {
    if size <= ALIGN {
        ALIGN
    } else if size <= FACTOR_MAXSIZE {
        (size + ALIGN - 1) & !(ALIGN - 1)
    } else if size <= MAXSIZE {
        (size + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
    } else {
        geo.round_up(size)
    }
}

/// Whether `size` is exactly the size of some bucket.
#[inline]
pub const fn is_legal(size: usize) -> bool {
    size != 0
        && size <= MAXSIZE
        && size % ALIGN == 0
        && (size <= FACTOR_MAXSIZE || size % BLOCK_SIZE == 0)
}

/// The bucket holding blocks of `size`, which must be at most [`MAXSIZE`].
/// Sizes between classes map to the next bigger bucket.
#[inline]
pub const fn bucket_for(size: usize) -> usize {
    debug_assert!(size <= MAXSIZE);

    if size <= FACTOR_MAXSIZE {
        let size = if size < ALIGN { ALIGN } else { size };
        (size + ALIGN - 1) / ALIGN - 1
    } else {
        FACTOR_BUCKETS - 1 + (size - FACTOR_MAXSIZE + BLOCK_SIZE - 1) / BLOCK_SIZE
    }
}

/// The block size of `bucket`.
#[inline]
pub const fn bucket_size(bucket: usize) -> usize {
    debug_assert!(bucket < BUCKETS);

    if bucket < FACTOR_BUCKETS {
        (bucket + 1) * ALIGN
    } else {
        FACTOR_MAXSIZE + (bucket + 1 - FACTOR_BUCKETS) * BLOCK_SIZE
    }
}

/// Whether a block of `size` may be filed into `bucket`.
#[inline]
pub const fn falls_in_bucket(size: usize, bucket: usize) -> bool {
    is_legal(size) && bucket_size(bucket) == size
}

/// Whether a free block of `block` bytes serving a request of `wanted`
/// bytes should be split, rather than handed out whole.
#[inline]
pub const fn should_split(block: usize, wanted: usize) -> bool {
    let waste = block - wanted;
    waste >= MIN_SPLIT && waste >= block / SPLIT_FRACTION
}

/// Cuts a multiple of [`ALIGN`] into legal block sizes, biggest first.
#[derive(Debug, Clone)]
pub struct LegalPieces {
    rest: usize,
}

impl LegalPieces {
    pub const fn new(len: usize) -> Self {
        debug_assert!(len % ALIGN == 0);
        Self { rest: len }
    }
}

impl Iterator for LegalPieces {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let piece = if self.rest == 0 {
            return None;
        } else if self.rest > MAXSIZE {
            MAXSIZE
        } else if self.rest > FACTOR_MAXSIZE {
            self.rest & !(BLOCK_SIZE - 1)
        } else {
            self.rest
        };

        self.rest -= piece;
        Some(piece)
    }
}
