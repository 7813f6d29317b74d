//! Tracks which freelist buckets hold blocks.
//!
//! Bits are flipped while the bucket's lock is held, but read without it:
//! a stale read only costs a wasted lock or a missed reuse, never a wrong block.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::quantize::BUCKETS;

const WORD_BITS: usize = usize::BITS as usize;
const WORDS: usize = (BUCKETS + WORD_BITS - 1) / WORD_BITS;

#[derive(Debug)]
pub(crate) struct Availability {
    words: [AtomicUsize; WORDS],
    /// Upper bound of the highest non-empty bucket. Only ever raised.
    highest: AtomicUsize,
}

impl Availability {
    pub const fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self { words: [ZERO; WORDS], highest: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn set_bit(&self, b: usize) {
        self.words[b / WORD_BITS].fetch_or(1 << (b % WORD_BITS), Ordering::Release);
        self.highest.fetch_max(b, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_bit(&self, b: usize) {
        self.words[b / WORD_BITS].fetch_and(!(1 << (b % WORD_BITS)), Ordering::Release);
    }

    #[inline]
    pub fn read_bit(&self, b: usize) -> bool {
        self.words[b / WORD_BITS].load(Ordering::Acquire) & 1 << (b % WORD_BITS) != 0
    }

    /// Finds the lowest set bit at index `b` or greater.
    pub fn bit_scan_after(&self, b: usize) -> Option<usize> {
        let highest = self.highest.load(Ordering::Relaxed);
        let mut w = b / WORD_BITS;

        if b > highest {
            return None;
        }

        let mut word = self.words[w].load(Ordering::Acquire) >> (b % WORD_BITS) << (b % WORD_BITS);

        loop {
            if word != 0 {
                let found = w * WORD_BITS + word.trailing_zeros() as usize;
                return (found <= highest).then_some(found);
            }

            w += 1;
            if w >= WORDS || w * WORD_BITS > highest {
                return None;
            }
            word = self.words[w].load(Ordering::Acquire);
        }
    }

    /// Iterates over set bits from `b` upwards.
    pub fn iter_from(&self, b: usize) -> impl Iterator<Item = usize> + '_ {
        let mut next = Some(b);
        core::iter::from_fn(move || {
            let found = self.bit_scan_after(next?)?;
            next = (found + 1 < BUCKETS).then_some(found + 1);
            Some(found)
        })
    }
}
