use core::fmt;

/// A broken internal invariant, as found by [`XMalloc::check`](crate::XMalloc::check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// A region fragment starts before the previous one ends.
    RegionOverlap { index: usize, start: usize, prev_end: usize },
    /// A region fragment is empty or inverted.
    RegionEmpty { index: usize, start: usize, end: usize },
    /// Two touching fragments of the same kind were left separate.
    RegionNotCoalesced { index: usize, addr: usize },
    /// A free block's size tag does not match its bucket's size.
    BucketTag { bucket: usize, addr: usize, found: usize },
    /// A bucket's sorted prefix is out of order.
    BucketOrder { bucket: usize, index: usize },
    /// The availability bitmap disagrees with a bucket's population.
    BucketBitmap { bucket: usize, count: usize },
    /// A cache line holds a misordered or duplicate entry.
    CacheOrder { line: usize, index: usize },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Inconsistency::RegionOverlap { index, start, prev_end } => write!(
                f,
                "region fragment #{} at {:#x} overlaps its predecessor ending at {:#x}",
                index, start, prev_end
            ),
            Inconsistency::RegionEmpty { index, start, end } => {
                write!(f, "region fragment #{} is empty ({:#x}..{:#x})", index, start, end)
            }
            Inconsistency::RegionNotCoalesced { index, addr } => write!(
                f,
                "region fragments #{} and #{} touch at {:#x} but were not coalesced",
                index - 1,
                index,
                addr
            ),
            Inconsistency::BucketTag { bucket, addr, found } => {
                write!(f, "block {:#x} in bucket {} carries size tag {}", addr, bucket, found)
            }
            Inconsistency::BucketOrder { bucket, index } => {
                write!(f, "bucket {} is unsorted at index {}", bucket, index)
            }
            Inconsistency::BucketBitmap { bucket, count } => write!(
                f,
                "availability bit of bucket {} disagrees with its {} blocks",
                bucket, count
            ),
            Inconsistency::CacheOrder { line, index } => {
                write!(f, "cache line {} is unsorted at index {}", line, index)
            }
        }
    }
}
