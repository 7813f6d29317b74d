//! The bootstrap heap.
//!
//! Before the page layer is ready, and while it initializes on the calling
//! thread, allocations are bump-allocated from the process heap through
//! [`PageSource::grow_heap`]. Freeing the topmost block moves the top back,
//! and once whole pages are spare past the top the heap is shrunk again.
//! Blocks below the top are only reclaimed when every boot block is free.

use crate::{
    header::BlockHandle,
    ptr_utils::align_up_by,
    quantize::ALIGN,
    source::PageSource,
    stats::HeapStats,
    sync::Mutex,
};

/// Heap growth granularity.
const BOOT_CHUNK: usize = 64 << 10;

#[derive(Debug)]
struct Inner {
    start: usize,
    top: usize,
    end: usize,
    live: usize,
    /// Heap bytes below a break someone else moved. Never given back.
    abandoned: usize,
}

impl Inner {
    fn reserved(&self) -> usize {
        self.end - self.start + self.abandoned
    }
}

#[derive(Debug)]
pub(crate) struct BootHeap {
    inner: Mutex<Inner>,
}

impl BootHeap {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(Inner { start: 0, top: 0, end: 0, live: 0, abandoned: 0 }) }
    }

    /// Bump-allocates a block of `len` bytes. Returns `None` when the heap
    /// cannot be extended.
    pub fn alloc<S: PageSource>(&self, source: &S, len: usize, stats: &HeapStats) -> Option<BlockHandle> {
        debug_assert!(len % ALIGN == 0);
        let mut inner = self.inner.lock();
        let old_reserved = inner.reserved();

        let mut base = align_up_by(inner.top, ALIGN - 1);

        if inner.end == 0 || base + len > inner.end {
            let increment = align_up_by(len + ALIGN, BOOT_CHUNK - 1);
            let old_break = source.grow_heap(isize::try_from(increment).ok()?)?.as_ptr() as usize;

            if old_break != inner.end {
                // first use, or someone else moved the break: start over past it.
                // Blocks left below are still freed through `live`.
                inner.abandoned += inner.end - inner.start;
                inner.start = old_break;
                base = align_up_by(old_break, ALIGN - 1);
            }
            inner.end = old_break + increment;
        }

        inner.top = base + len;
        inner.live += 1;
        stats.account_boot(old_reserved, inner.reserved());

        // SAFETY: `base..base + len` lies below the break and belongs to nobody else
        Some(unsafe { BlockHandle::from_addr(base, len) })
    }

    /// Grows or shrinks the topmost block in place. Returns false if `block`
    /// is not the topmost block or the heap cannot be extended.
    pub fn resize_top<S: PageSource>(
        &self,
        source: &S,
        block: BlockHandle,
        new_len: usize,
        stats: &HeapStats,
    ) -> bool {
        let mut inner = self.inner.lock();
        if block.end() != inner.top {
            return false;
        }

        let old_reserved = inner.reserved();
        let new_top = block.addr() + new_len;

        if new_top > inner.end {
            let increment = align_up_by(new_top - inner.end, BOOT_CHUNK - 1);
            let Ok(signed) = isize::try_from(increment) else { return false };
            match source.grow_heap(signed) {
                Some(old) if old.as_ptr() as usize == inner.end => inner.end += increment,
                Some(_) => {
                    // not contiguous, give the stray growth straight back
                    let _ = source.grow_heap(-signed);
                    return false;
                }
                None => return false,
            }
        }

        inner.top = new_top;
        self.trim(source, &mut inner);
        stats.account_boot(old_reserved, inner.reserved());
        true
    }

    /// Frees a boot block.
    pub fn free<S: PageSource>(&self, source: &S, block: BlockHandle, stats: &HeapStats) {
        let mut inner = self.inner.lock();
        let old_reserved = inner.reserved();

        inner.live -= 1;
        if inner.live == 0 {
            inner.top = inner.start;
        } else if block.end() == inner.top {
            inner.top = block.addr();
        }

        self.trim(source, &mut inner);
        stats.account_boot(old_reserved, inner.reserved());
    }

    /// Gives whole spare pages past the top back to the OS, if nobody
    /// else has moved the break since.
    fn trim<S: PageSource>(&self, source: &S, inner: &mut Inner) {
        let page = source.page_size();
        let keep = align_up_by(inner.top, page - 1);

        if inner.end < keep + page || source.heap_break() as usize != inner.end {
            return;
        }

        let spare = inner.end - keep;
        let Ok(signed) = isize::try_from(spare) else { return };
        if source.grow_heap(-signed).is_some() {
            inner.end = keep;
            if inner.end == inner.start {
                inner.start = 0;
                inner.top = 0;
                inner.end = 0;
            }
        }
    }

    /// Bytes currently obtained from the heap, abandoned extents included.
    pub fn reserved(&self) -> usize {
        self.inner.lock().reserved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{stats::Counters, test_utils::TestSource};

    fn boot_bytes(stats: &HeapStats) -> usize {
        let mut c = Counters::default();
        stats.fill(&mut c);
        c.boot_bytes
    }

    #[test]
    fn bump_and_retreat() {
        let source = TestSource::new();
        let stats = HeapStats::new();
        let boot = BootHeap::new();

        let a = boot.alloc(&source, 64, &stats).unwrap();
        let b = boot.alloc(&source, 128, &stats).unwrap();
        assert_eq!(a.end(), b.addr());
        assert_eq!(boot_bytes(&stats), source.heap_used());

        // freeing the top block lets the next allocation reuse it
        boot.free(&source, b, &stats);
        let c = boot.alloc(&source, 32, &stats).unwrap();
        assert_eq!(c.addr(), b.addr());

        boot.free(&source, c, &stats);
        boot.free(&source, a, &stats);
        assert_eq!(source.heap_used(), 0);
        assert_eq!(boot_bytes(&stats), 0);
        assert_eq!(boot.reserved(), 0);
    }

    #[test]
    fn big_allocations_grow_and_trailing_frees_shrink() {
        let source = TestSource::new();
        let stats = HeapStats::new();
        let boot = BootHeap::new();
        let page = source.page_size();

        let a = boot.alloc(&source, 64, &stats).unwrap();
        let big = boot.alloc(&source, 4 * BOOT_CHUNK, &stats).unwrap();
        let grown = source.heap_used();
        assert!(grown >= 4 * BOOT_CHUNK + 64);

        boot.free(&source, big, &stats);
        assert!(source.heap_used() < grown);
        assert!(source.heap_used() <= align_up_by(a.end(), page - 1) - a.addr() + page);
        assert_eq!(boot_bytes(&stats), boot.reserved());

        boot.free(&source, a, &stats);
        assert_eq!(source.heap_used(), 0);
    }

    #[test]
    fn top_block_resizes_in_place() {
        let source = TestSource::new();
        let stats = HeapStats::new();
        let boot = BootHeap::new();

        let a = boot.alloc(&source, 64, &stats).unwrap();
        let b = boot.alloc(&source, 64, &stats).unwrap();

        assert!(!boot.resize_top(&source, a, 128, &stats));
        assert!(boot.resize_top(&source, b, 2 * BOOT_CHUNK, &stats));
        assert!(boot.resize_top(&source, unsafe { BlockHandle::from_addr(b.addr(), 2 * BOOT_CHUNK) }, 32, &stats));

        let c = boot.alloc(&source, 16, &stats).unwrap();
        assert_eq!(c.addr(), b.addr() + 32);
    }

    #[test]
    fn moved_break_keeps_old_extent_counted() {
        let source = TestSource::new();
        let stats = HeapStats::new();
        let boot = BootHeap::new();
        let page = source.page_size();

        let a = boot.alloc(&source, 64, &stats).unwrap();
        let first = boot.reserved();
        assert_eq!(first, BOOT_CHUNK);

        // someone else grows the heap right past our extent
        source.grow_heap(page as isize).unwrap();
        let big = boot.alloc(&source, BOOT_CHUNK, &stats).unwrap();
        assert_eq!(big.addr(), a.addr() + first + page);
        assert_eq!(boot.reserved(), first + 2 * BOOT_CHUNK);
        assert_eq!(boot_bytes(&stats), boot.reserved());

        // the new extent goes back, the one below the stranger stays counted
        boot.free(&source, big, &stats);
        boot.free(&source, a, &stats);
        assert_eq!(boot.reserved(), first);
        assert_eq!(boot_bytes(&stats), first);
        assert_eq!(source.heap_used(), first + page);
    }
}
