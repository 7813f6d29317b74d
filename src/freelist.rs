//! The segregated freelist: one bucket per size class.
//!
//! Buckets are locked one at a time, never nested, so that concurrent frees
//! on unrelated addresses only contend on the buckets they touch. A block in
//! transit between buckets is owned by the thread moving it.

use core::{
    cell::RefCell,
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::{
    bitfield::Availability,
    bucket::Bucket,
    clock::Clock,
    config::Config,
    corevec::CoreMemory,
    crash::fatal,
    error::Inconsistency,
    header::BlockHandle,
    page::PageGeometry,
    quantize::{bucket_for, bucket_size, is_legal, LegalPieces, BUCKETS, MAXSIZE},
    source::PageSource,
    stats::Usage,
    sync::ReentrantMutex,
    vmm::Vmm,
};

/// What the freelist needs from the page layer.
pub(crate) trait Backend {
    /// Where bucket storage comes from.
    fn core(&self) -> &dyn CoreMemory;
    fn geometry(&self) -> PageGeometry;
    fn now(&self) -> u64;
    /// Returns whole pages of user memory.
    fn release_pages(&self, addr: usize, len: usize);
}

impl<S: PageSource, C: Clock> Backend for Vmm<S, C> {
    fn core(&self) -> &dyn CoreMemory {
        self
    }

    fn geometry(&self) -> PageGeometry {
        Vmm::geometry(self)
    }

    fn now(&self) -> u64 {
        Vmm::now(self)
    }

    fn release_pages(&self, addr: usize, len: usize) {
        self.free_pages(addr, len, Usage::User);
    }
}

/// How hard [`Freelist::insert`] tries to merge a block with its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coalesce {
    /// File the block as is.
    Never,
    /// Merge with free neighbours unless freeing in bursts, or the block is a
    /// page divisor whose bucket is already well stocked.
    Smart,
}

type BucketLock = CachePadded<ReentrantMutex<RefCell<Bucket>>>;

/// Bits of address hash in [`Boundaries`].
const BOUNDARY_BITS: u32 = 12;
const BOUNDARY_SLOTS: usize = 1 << BOUNDARY_BITS;

/// Free block starts and ends, counted per address hash.
///
/// A zero count proves that no filed block starts (or ends) at an address,
/// so merging can skip the bucket scan. Counts are raised before a block is
/// filed and lowered after it is taken, so they never fall short.
struct Boundaries {
    starts: [AtomicU32; BOUNDARY_SLOTS],
    ends: [AtomicU32; BOUNDARY_SLOTS],
}

impl Boundaries {
    const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self { starts: [ZERO; BOUNDARY_SLOTS], ends: [ZERO; BOUNDARY_SLOTS] }
    }

    #[inline]
    fn slot(addr: usize) -> usize {
        ((addr as u64 >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - BOUNDARY_BITS)) as usize
    }

    fn add(&self, addr: usize, len: usize) {
        self.starts[Self::slot(addr)].fetch_add(1, Ordering::Relaxed);
        self.ends[Self::slot(addr + len)].fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, addr: usize, len: usize) {
        self.starts[Self::slot(addr)].fetch_sub(1, Ordering::Relaxed);
        self.ends[Self::slot(addr + len)].fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn may_start(&self, addr: usize) -> bool {
        self.starts[Self::slot(addr)].load(Ordering::Relaxed) != 0
    }

    #[inline]
    fn may_end(&self, addr: usize) -> bool {
        self.ends[Self::slot(addr)].load(Ordering::Relaxed) != 0
    }
}

pub(crate) struct Freelist {
    buckets: [BucketLock; BUCKETS],
    avail: Availability,
    boundaries: Boundaries,
    config: Config,

    burst_window: AtomicU64,
    burst_frees: AtomicUsize,
}

impl Freelist {
    pub const fn new(config: Config) -> Self {
        const BUCKET: BucketLock = CachePadded::new(ReentrantMutex::new(RefCell::new(Bucket::new())));

        Self {
            buckets: [BUCKET; BUCKETS],
            avail: Availability::new(),
            boundaries: Boundaries::new(),
            config,
            burst_window: AtomicU64::new(0),
            burst_frees: AtomicUsize::new(0),
        }
    }

    /// Runs `f` on bucket `b` with its lock held.
    #[inline]
    fn with_bucket<R>(&self, b: usize, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let guard = self.buckets[b].lock();
        let mut bucket = guard.borrow_mut();
        f(&mut bucket)
    }

    fn verify_tag(&self, b: usize, addr: usize) {
        // SAFETY: the address was just taken from bucket `b`, it is a free block
        let found = unsafe { BlockHandle::read_free_tag(addr) };
        if found != bucket_size(b) {
            fatal!(
                None,
                "free block {:#x} in bucket {} of size {} carries size tag {}",
                addr,
                b,
                bucket_size(b),
                found
            );
        }
    }

    /// Counts a free towards burst detection. Returns whether a burst is ongoing.
    fn note_free(&self, now: u64) -> bool {
        let window = now / 1000;

        if self.burst_window.load(Ordering::Relaxed) != window {
            self.burst_window.store(window, Ordering::Relaxed);
            self.burst_frees.store(1, Ordering::Relaxed);
            return false;
        }

        self.burst_frees.fetch_add(1, Ordering::Relaxed) + 1 > self.config.burst_threshold
    }

    /// Whether blocks of `len` bytes are better kept apart: they tile pages
    /// exactly and their bucket is already well stocked.
    fn keeps(&self, len: usize, geo: PageGeometry) -> bool {
        geo.size() % len == 0
            && self.with_bucket(bucket_for(len), |b| b.count()) >= self.config.keep_threshold
    }

    /// Removes and returns a free block of at least `size` bytes, looking in
    /// the bucket for `size` first and then in bigger ones.
    ///
    /// `exclude` names a bucket to skip.
    pub fn lookup_and_remove(
        &self,
        size: usize,
        exclude: Option<usize>,
        backend: &dyn Backend,
    ) -> Option<BlockHandle> {
        if size > MAXSIZE {
            return None;
        }

        for b in self.avail.iter_from(bucket_for(size)) {
            if exclude == Some(b) {
                continue;
            }

            let popped = self.with_bucket(b, |bucket| {
                let addr = bucket.pop_preferred(self.config.growth)?;
                if bucket.count() == 0 {
                    self.avail.clear_bit(b);
                }
                bucket.maybe_shrink(backend.core(), backend.now(), self.config.bucket_shrink_period_ms);
                Some(addr)
            });

            if let Some(addr) = popped {
                self.boundaries.remove(addr, bucket_size(b));
                self.verify_tag(b, addr);
                // SAFETY: free blocks are never at address zero
                return Some(unsafe { BlockHandle::from_addr(addr, bucket_size(b)) });
            }
        }

        None
    }

    /// Removes the free block at `addr` from bucket `b`, if it is there.
    fn take_from(&self, b: usize, addr: usize, backend: &dyn Backend) -> bool {
        let taken = self.with_bucket(b, |bucket| {
            let taken = bucket.take(addr, self.config.growth);
            if taken {
                if bucket.count() == 0 {
                    self.avail.clear_bit(b);
                }
                bucket.maybe_shrink(backend.core(), backend.now(), self.config.bucket_shrink_period_ms);
            }
            taken
        });

        if taken {
            self.boundaries.remove(addr, bucket_size(b));
            self.verify_tag(b, addr);
        }
        taken
    }

    /// Removes the free block of `size` bytes at `addr`, if it is there.
    pub fn take_exact(&self, addr: usize, size: usize, backend: &dyn Backend) -> bool {
        self.take_from(bucket_for(size), addr, backend)
    }

    /// Removes whichever free block starts at `addr`.
    pub fn take_at(&self, addr: usize, backend: &dyn Backend) -> Option<BlockHandle> {
        if !self.boundaries.may_start(addr) {
            return None;
        }

        self.avail.iter_from(0).find(|&b| self.take_from(b, addr, backend)).map(|b| {
            // SAFETY: `addr` was a free block of this size
            unsafe { BlockHandle::from_addr(addr, bucket_size(b)) }
        })
    }

    /// Files a legal block without looking at its neighbours.
    fn file(&self, block: BlockHandle, backend: &dyn Backend, sorted: bool) {
        debug_assert!(is_legal(block.len()));
        let b = bucket_for(block.len());

        // SAFETY: the block was handed to the freelist
        unsafe { block.write_free_tag() };
        self.boundaries.add(block.addr(), block.len());

        self.with_bucket(b, |bucket| {
            bucket.push(backend.core(), block.addr(), self.config.growth, sorted);
            self.avail.set_bit(b);
        });
    }

    /// Files any multiple of the alignment as a run of legal blocks.
    pub fn file_pieces(&self, addr: usize, len: usize, backend: &dyn Backend) {
        let mut at = addr;
        for piece in LegalPieces::new(len) {
            // SAFETY: pieces tile the range handed over by the caller
            self.file(unsafe { BlockHandle::from_addr(at, piece) }, backend, true);
            at += piece;
        }
    }

    /// Hands a free block to the freelist.
    ///
    /// The block may be any multiple of the alignment. Merged blocks
    /// bigger than [`MAXSIZE`] give their whole pages back to the page layer.
    pub fn insert(&self, block: BlockHandle, mode: Coalesce, backend: &dyn Backend) {
        let geo = backend.geometry();
        let burst = mode == Coalesce::Smart && self.note_free(backend.now());

        let (mut addr, mut len) = (block.addr(), block.len());

        let coalesce = mode == Coalesce::Smart
            && !burst
            && !(is_legal(len) && self.keeps(len, geo));

        if coalesce {
            'merge: while len <= MAXSIZE {
                let before = self.boundaries.may_end(addr);
                let after = self.boundaries.may_start(addr + len);
                if !before && !after {
                    break;
                }

                for b in self.avail.iter_from(0) {
                    let size = bucket_size(b);
                    let merged = len + size;

                    if !is_legal(merged) && merged <= MAXSIZE {
                        continue;
                    }

                    if let Some(prev) = addr.checked_sub(size).filter(|_| before) {
                        if self.take_from(b, prev, backend) {
                            addr = prev;
                            len = merged;
                            continue 'merge;
                        }
                    }

                    if after && self.take_from(b, addr + len, backend) {
                        len = merged;
                        continue 'merge;
                    }
                }

                break;
            }
        }

        if len > MAXSIZE {
            self.release_oversized(addr, len, backend);
        } else if is_legal(len) {
            // SAFETY: the merged range consists of blocks owned by this call
            self.file(unsafe { BlockHandle::from_addr(addr, len) }, backend, !burst);
        } else {
            self.file_pieces(addr, len, backend);
        }
    }

    /// Returns the whole pages of a big free range, filing what remains.
    fn release_oversized(&self, addr: usize, len: usize, backend: &dyn Backend) {
        let geo = backend.geometry();
        let end = addr + len;
        let first_page = geo.round_up(addr);
        let last_page = geo.round_down(end);

        if first_page < last_page {
            self.file_pieces(addr, first_page - addr, backend);
            backend.release_pages(first_page, last_page - first_page);
            self.file_pieces(last_page, end - last_page, backend);
        } else {
            self.file_pieces(addr, len, backend);
        }
    }

    /// Calls `f(addr, size)` for every free block, one bucket at a time.
    /// `f` must not touch the freelist.
    pub fn visit(&self, mut f: impl FnMut(usize, usize)) {
        for b in self.avail.iter_from(0) {
            let size = bucket_size(b);
            self.with_bucket(b, |bucket| bucket.entries().iter().for_each(|&addr| f(addr, size)));
        }
    }

    /// Number of free blocks and their total size.
    pub fn totals(&self) -> (usize, usize) {
        let (mut count, mut bytes) = (0, 0);
        self.visit(|_, size| {
            count += 1;
            bytes += size;
        });
        (count, bytes)
    }

    pub fn bucket_count(&self, b: usize) -> usize {
        self.with_bucket(b, |bucket| bucket.count())
    }

    pub fn check(&self) -> Result<(), Inconsistency> {
        for b in 0..BUCKETS {
            self.with_bucket(b, |bucket| {
                let count = bucket.count();
                if (count != 0) != self.avail.read_bit(b) {
                    return Err(Inconsistency::BucketBitmap { bucket: b, count });
                }
                bucket.check(b, bucket_size(b), self.config.growth)
            })?;
        }
        Ok(())
    }

    /// Writes one line per non-empty bucket. Buckets borrowed further up
    /// the calling thread's stack are reported as busy.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "  {:>6} {:>8} {:>8} {:>8}", "size", "blocks", "sorted", "capacity")?;

        for b in 0..BUCKETS {
            let Some(guard) = self.buckets[b].try_lock() else {
                writeln!(w, "  {:>6} <locked>", bucket_size(b))?;
                continue;
            };
            let Ok(bucket) = guard.try_borrow() else {
                writeln!(w, "  {:>6} <busy>", bucket_size(b))?;
                continue;
            };

            if bucket.count() != 0 {
                writeln!(
                    w,
                    "  {:>6} {:>8} {:>8} {:>8}",
                    bucket_size(b),
                    bucket.count(),
                    bucket.sorted(),
                    bucket.cap()
                )?;
            }
        }

        Ok(())
    }
}
