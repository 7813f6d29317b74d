//! The allocator context: heap allocation on top of the page layer.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use crate::{
    aligned::AlignedTable,
    boot::BootHeap,
    clock::Clock,
    config::Config,
    crash::{fatal, Diagnostics},
    error::Inconsistency,
    freelist::{Coalesce, Freelist},
    header::{BlockHandle, HEADER_SIZE, TAG_BOOT},
    quantize::{quantize, should_split, ALIGN, MAXSIZE},
    source::{PageSource, Protection},
    stats::{Counters, HeapStats, Usage},
    sync::{Claim, OwnerFlag},
    vmm::Vmm,
    xgc::{Collector, XgcReport},
};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const STOPPED: u8 = 3;

/// Where an allocation is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Boot,
    Heap,
}

/// A complete allocator: a page layer over a [`PageSource`] and a
/// segregated freelist heap over the page layer.
///
/// Const-constructible, so that it can be placed in a `static` and
/// installed as the global allocator:
///
/// ```no_run
/// use xmalloc::{Config, MonotonicClock, XMalloc, source::UnixMMapSource};
///
/// #[global_allocator]
/// static ALLOCATOR: XMalloc<UnixMMapSource, MonotonicClock> =
///     XMalloc::new(UnixMMapSource::new(), MonotonicClock::new(), Config::new());
///
/// fn main() {
///     ALLOCATOR.post_init();
/// }
/// ```
///
/// Until [`XMalloc::init`] has run, allocations come from a bootstrap heap
/// grown through [`PageSource::grow_heap`]. With [`Config::lazy_init`] the
/// first allocation initializes the allocator instead.
pub struct XMalloc<S: PageSource, C: Clock> {
    vmm: Vmm<S, C>,
    freelist: Freelist,
    boot: BootHeap,
    aligned: AlignedTable,
    collector: Collector,
    stats: HeapStats,
    config: Config,

    state: AtomicU8,
    initializing: OwnerFlag,
    auto_collect: AtomicBool,
}

impl<S: PageSource, C: Clock> XMalloc<S, C> {
    pub const fn new(source: S, clock: C, config: Config) -> Self {
        Self {
            vmm: Vmm::new(source, clock, config),
            freelist: Freelist::new(config),
            boot: BootHeap::new(),
            aligned: AlignedTable::new(),
            collector: Collector::new(),
            stats: HeapStats::new(),
            config,
            state: AtomicU8::new(UNINIT),
            initializing: OwnerFlag::new(),
            auto_collect: AtomicBool::new(false),
        }
    }

    /// Brings up the page layer. Idempotent; a thread racing another
    /// thread's initialization waits for it to finish.
    pub fn init(&self) {
        match self.initializing.claim() {
            Claim::Acquired => {}
            Claim::Recursive => return,
            Claim::Busy => {
                while self.initializing.is_held() {
                    core::hint::spin_loop();
                }
                return;
            }
        }

        if self.state.load(Ordering::Acquire) != UNINIT {
            self.initializing.release();
            return;
        }

        self.state.store(INITIALIZING, Ordering::Release);
        self.vmm.init();
        self.state.store(READY, Ordering::Release);
        self.initializing.release();

        log::info!(
            "xmalloc: initialized with {}-byte pages, {:?} growth, kernel map {}",
            self.vmm.geometry().size(),
            self.config.growth,
            if self.vmm.kernel_map().is_some() { "loaded" } else { "not loaded" },
        );
    }

    /// Enables background work that needs a fully running program, currently
    /// the periodic fragmentation collector.
    pub fn post_init(&self) {
        self.init();
        self.auto_collect.store(true, Ordering::Relaxed);
        log::debug!("xmalloc: collector runs at most every {} ms", self.config.xgc_period_ms);
    }

    /// Returns cached pages to the OS and stops honoring frees, for a fast
    /// process exit. Allocation keeps working.
    pub fn shutdown(&self) {
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        let released = self.vmm.flush();
        log::info!("xmalloc: shut down, {} cached pages released", released);
    }

    fn route(&self) -> Route {
        loop {
            match self.state.load(Ordering::Acquire) {
                READY | STOPPED => return Route::Heap,
                UNINIT if !self.config.lazy_init => return Route::Boot,
                UNINIT => self.init(),
                _ if self.initializing.is_held_by_me() => return Route::Boot,
                _ => core::hint::spin_loop(),
            }
        }
    }

    /// Housekeeping run from entry points that hold nothing.
    fn tick(&self) {
        if self.auto_collect.load(Ordering::Relaxed) {
            self.collect();
        }
        self.vmm.maintain();
    }

    /// Physical block length for a request of `size` bytes.
    fn block_len(&self, size: usize) -> usize {
        match size.checked_add(HEADER_SIZE) {
            Some(total) if total <= isize::MAX as usize / 2 => quantize(total, self.vmm.geometry()),
            _ => fatal!(Some(self), "allocation of {} bytes is too large", size),
        }
    }

    /// Hands a freshly obtained block out, splitting off what is not needed.
    fn trim(&self, block: BlockHandle, len: usize) -> BlockHandle {
        if block.len() <= len || !should_split(block.len(), len) {
            return block;
        }

        let (head, tail) = block.split(len);
        if let Some(tail) = tail {
            self.freelist.insert(tail, Coalesce::Never, &self.vmm);
        }
        head
    }

    /// A heap block of at least `len` bytes, `len` being legal.
    fn heap_block(&self, len: usize) -> BlockHandle {
        if let Some(block) = self.freelist.lookup_and_remove(len, None, &self.vmm) {
            return self.trim(block, len);
        }

        let geo = self.vmm.geometry();
        let (ptr, _) = self.vmm.alloc_pages(len, Usage::User);
        // SAFETY: fresh page memory, page aligned
        let block = unsafe { BlockHandle::new(ptr, geo.round_up(len)) };
        self.trim(block, len)
    }

    fn boot_block(&self, len: usize) -> BlockHandle {
        match self.boot.alloc(self.vmm.source(), len, &self.stats) {
            Some(block) => block,
            None => fatal!(Some(self), "bootstrap heap cannot grow by {} bytes", len),
        }
    }

    /// Obtains a block of `len` bytes and writes its header.
    fn block_for(&self, route: Route, len: usize) -> BlockHandle {
        let (block, tags) = match route {
            Route::Boot => (self.boot_block(len), TAG_BOOT),
            Route::Heap if len > MAXSIZE => {
                let (ptr, _) = self.vmm.alloc_pages(len, Usage::User);
                // SAFETY: fresh page memory, page aligned
                (unsafe { BlockHandle::new(ptr, len) }, 0)
            }
            Route::Heap => (self.heap_block(len), 0),
        };

        // SAFETY: the block was just handed to us
        unsafe { block.write_header(tags) };
        self.stats.account_alloc(block.len());
        block
    }

    /// Allocates `size` bytes aligned to 16. Never fails: running out of
    /// memory aborts the process.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        let route = self.route();
        let len = self.block_len(size);
        self.block_for(route, len).user_ptr()
    }

    /// Like [`XMalloc::allocate`], with the memory zeroed.
    pub fn allocate_zeroed(&self, size: usize) -> NonNull<u8> {
        let ptr = self.allocate(size);
        // SAFETY: just allocated `size` bytes
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        ptr
    }

    /// Zeroed room for `count` elements of `size` bytes.
    ///
    /// Aborts the process if the total overflows.
    pub fn allocate_array_zeroed(&self, count: usize, size: usize) -> NonNull<u8> {
        match count.checked_mul(size) {
            Some(total) => self.allocate_zeroed(total),
            None => fatal!(Some(self), "array of {} elements of {} bytes overflows", count, size),
        }
    }

    /// Allocates `size` bytes aligned to `align`, a power of two.
    pub fn allocate_aligned(&self, align: usize, size: usize) -> NonNull<u8> {
        if !align.is_power_of_two() {
            fatal!(Some(self), "alignment {} is not a power of two", align);
        }
        if align <= ALIGN {
            return self.allocate(size);
        }

        let route = self.route();
        let geo = self.vmm.geometry();
        let len = self.block_len(size);

        if route == Route::Heap && AlignedTable::zone_fits(align, size, geo) {
            self.stats.account_alloc(align);
            self.stats.account_aligned(true);
            return self.aligned.zone_alloc(&self.vmm, align);
        }

        let padded = len + align;
        if route == Route::Heap && (align > geo.size() || quantize(padded, geo) > MAXSIZE) {
            let len = geo.round_up(size.max(1));
            self.stats.account_alloc(len);
            self.stats.account_aligned(true);
            return self.aligned.pages_alloc(&self.vmm, align.max(geo.size()), len);
        }

        // over-allocate, then give back the head and tail
        let padded = quantize(padded, geo);
        let raw = match route {
            Route::Boot => self.boot_block(padded),
            Route::Heap => self.heap_block(padded),
        };

        let user = (raw.addr() + HEADER_SIZE + align - 1) & !(align - 1);
        let base = user - HEADER_SIZE;
        // SAFETY: `base..raw.end()` lies within `raw`
        let block = unsafe { BlockHandle::from_addr(base, raw.end() - base) };

        let block = match route {
            // the boot heap reclaims the gap once all its blocks are free
            Route::Boot => block,
            Route::Heap => {
                if base > raw.addr() {
                    let (head, _) = raw.split(base - raw.addr());
                    self.freelist.insert(head, Coalesce::Never, &self.vmm);
                }
                self.trim(block, len)
            }
        };

        let tags = if route == Route::Boot { TAG_BOOT } else { 0 };
        // SAFETY: the block is ours
        unsafe { block.write_header(tags) };
        self.stats.account_alloc(block.len());
        block.user_ptr()
    }

    /// Reads the header of an allocated block, aborting on corruption.
    unsafe fn block_of(&self, ptr: NonNull<u8>) -> (BlockHandle, usize) {
        match BlockHandle::from_user(ptr) {
            Ok(found) => found,
            Err(e) => fatal!(Some(self), "invalid pointer {:p}: {}", ptr.as_ptr(), e),
        }
    }

    /// Frees memory from any of the allocation functions.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        if self.state.load(Ordering::Acquire) == STOPPED {
            return;
        }

        if self.aligned.may_own(ptr) {
            if let Some(usable) = self.aligned.release(&self.vmm, ptr) {
                self.stats.account_dealloc(usable);
                self.stats.account_aligned(false);
                self.tick();
                return;
            }
        }

        let (block, tags) = self.block_of(ptr);
        block.mark_freed();
        self.stats.account_dealloc(block.len());

        if tags & TAG_BOOT != 0 {
            self.boot.free(self.vmm.source(), block, &self.stats);
            return;
        }

        if block.len() > MAXSIZE {
            self.vmm.free_pages(block.addr(), block.len(), Usage::User);
        } else {
            self.freelist.insert(block, Coalesce::Smart, &self.vmm);
        }

        self.tick();
    }

    /// Resizes an allocation, in place when possible.
    ///
    /// A `None` pointer allocates; a zero size frees and returns `None`.
    ///
    /// # Safety
    /// `ptr`, if any, must come from this allocator. On success it must not
    /// be used again unless returned.
    pub unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return Some(self.allocate(size));
        };

        if size == 0 {
            self.free(ptr);
            return None;
        }

        if self.aligned.may_own(ptr) {
            if let Some(usable) = self.aligned.usable(ptr, self.vmm.geometry()) {
                if size <= usable {
                    return Some(ptr);
                }
                return Some(self.move_to_new(ptr, usable, size));
            }
        }

        let (block, tags) = self.block_of(ptr);
        let len = self.block_len(size);

        if len == block.len() {
            return Some(ptr);
        }

        let resized = if tags & TAG_BOOT != 0 {
            self.resize_boot(block, len)
        } else if block.len() > MAXSIZE {
            self.resize_pages(block, len)
        } else {
            self.resize_heap(block, len)
        };

        match resized {
            Some(new) => {
                new.write_header(tags);
                self.stats.account_resize(block.len(), new.len());
                Some(ptr)
            }
            None => Some(self.move_to_new(ptr, block.usable(), size)),
        }
    }

    unsafe fn resize_boot(&self, block: BlockHandle, len: usize) -> Option<BlockHandle> {
        if self.boot.resize_top(self.vmm.source(), block, len, &self.stats) {
            return Some(BlockHandle::from_addr(block.addr(), len));
        }
        (len < block.len()).then_some(block)
    }

    unsafe fn resize_pages(&self, block: BlockHandle, len: usize) -> Option<BlockHandle> {
        if len > MAXSIZE && len < block.len() {
            self.vmm.shrink(block.base(), block.len(), len);
            return Some(BlockHandle::from_addr(block.addr(), len));
        }
        if len > block.len() && self.vmm.grow(block.base(), block.len(), len) {
            return Some(BlockHandle::from_addr(block.addr(), len));
        }
        None
    }

    unsafe fn resize_heap(&self, block: BlockHandle, len: usize) -> Option<BlockHandle> {
        if len < block.len() {
            if !should_split(block.len(), len) {
                return Some(block);
            }
            let (head, tail) = block.split(len);
            if let Some(tail) = tail {
                self.freelist.insert(tail, Coalesce::Smart, &self.vmm);
            }
            return Some(head);
        }

        if len > MAXSIZE {
            return None;
        }

        let next = self.freelist.take_at(block.end(), &self.vmm)?;
        let merged = block.len() + next.len();
        if merged < len || (merged > MAXSIZE && !should_split(merged, len)) {
            self.freelist.insert(next, Coalesce::Never, &self.vmm);
            return None;
        }

        Some(self.trim(BlockHandle::from_addr(block.addr(), merged), len))
    }

    unsafe fn move_to_new(&self, ptr: NonNull<u8>, old_usable: usize, size: usize) -> NonNull<u8> {
        let new = self.allocate(size);
        new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old_usable.min(size));
        self.free(ptr);
        new
    }

    /// Bytes usable at `ptr`, at least what was requested.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        if self.aligned.may_own(ptr) {
            if let Some(usable) = self.aligned.usable(ptr, self.vmm.geometry()) {
                return usable;
            }
        }
        self.block_of(ptr).0.usable()
    }

    /// Allocates whole pages, bypassing the heap.
    pub fn page_alloc(&self, size: usize) -> NonNull<u8> {
        self.init();
        let ptr = self.vmm.alloc(size);
        self.vmm.maintain();
        ptr
    }

    /// Frees pages from [`XMalloc::page_alloc`]. Sub-ranges may be freed separately.
    ///
    /// # Safety
    /// The pages must come from [`XMalloc::page_alloc`] and not be used afterwards.
    pub unsafe fn page_free(&self, ptr: NonNull<u8>, size: usize) {
        if self.state.load(Ordering::Acquire) == STOPPED {
            return;
        }
        self.vmm.free(ptr, size);
        self.vmm.maintain();
    }

    /// Releases the pages of an allocation past `new_size`.
    ///
    /// # Safety
    /// See [`XMalloc::page_free`].
    pub unsafe fn page_shrink(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) {
        self.vmm.shrink(ptr, old_size, new_size);
    }

    /// Changes the protection of pages from [`XMalloc::page_alloc`].
    ///
    /// # Safety
    /// See [`XMalloc::page_free`]; revoking access to memory still referenced is undefined behavior.
    pub unsafe fn page_protect(&self, ptr: NonNull<u8>, size: usize, prot: Protection) -> bool {
        self.vmm.protect(ptr, size, prot)
    }

    /// Records a mapping the program made itself, so the allocator does not
    /// try to place its own mappings there.
    pub fn note_client_mapping(&self, start: NonNull<u8>, len: usize) {
        self.init();
        self.vmm.note_client_mapping(start.as_ptr() as usize, len);
    }

    /// Forgets a mapping recorded with [`XMalloc::note_client_mapping`].
    pub fn note_client_unmapping(&self, start: NonNull<u8>, len: usize) {
        self.init();
        self.vmm.note_client_unmapping(start.as_ptr() as usize, len);
    }

    /// Runs the fragmentation collector, unless it ran less than
    /// [`Config::xgc_period_ms`] ago.
    pub fn collect(&self) -> Option<XgcReport> {
        if self.state.load(Ordering::Acquire) != READY
            || !self.collector.due(self.vmm.now(), self.config.xgc_period_ms)
        {
            return None;
        }

        let report = self.collector.run(&self.freelist, &self.vmm);
        self.stats.account_xgc(report.pages_released);
        if report.pages_released != 0 {
            log::debug!("xmalloc: xgc {}", report);
        }
        Some(report)
    }

    /// The page layer.
    pub fn vmm(&self) -> &Vmm<S, C> {
        &self.vmm
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A snapshot of every counter.
    pub fn counters(&self) -> Counters {
        let mut c = Counters::default();
        self.stats.fill(&mut c);
        self.vmm.fill_counters(&mut c);
        c
    }

    /// Verifies the freelist, region maps and page cache.
    pub fn check(&self) -> Result<(), Inconsistency> {
        self.freelist.check()?;
        self.vmm.check()
    }

    /// Writes counters, buckets, aligned allocations, region maps and cache.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "{}", self.counters())?;
        match self.collector.last_run() {
            Some(t) => writeln!(w, "xgc: last pass at {} ms", t)?,
            None => writeln!(w, "xgc: never ran")?,
        }
        writeln!(w, "buckets:")?;
        self.freelist.dump(w)?;
        writeln!(w, "aligned:")?;
        self.aligned.dump(w)?;
        self.vmm.dump(w)
    }
}

impl<S: PageSource, C: Clock> Diagnostics for XMalloc<S, C> {
    fn report(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        self.dump(w)
    }
}

impl<S: PageSource, C: Clock> fmt::Debug for XMalloc<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XMalloc")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("config", &self.config)
            .field("vmm", &self.vmm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        clock::ManualClock,
        quantize::bucket_for,
        test_utils::{scribble, verify, xmalloc, TestSource, TestXMalloc},
    };

    fn config() -> Config {
        Config::new().with_kernel_map(false)
    }

    fn mapped(xm: &TestXMalloc) -> u64 {
        xm.counters().total_mapped_bytes
    }

    #[test]
    fn freed_blocks_are_reused_without_new_pages() {
        let xm = xmalloc(config());

        let ptrs = (0..10_000).map(|_| xm.allocate(16)).collect::<Vec<_>>();
        for (i, p) in ptrs.iter().enumerate() {
            scribble(*p, 16, i as u8);
        }
        xm.check().unwrap();

        for p in ptrs.iter().step_by(2) {
            unsafe { xm.free(*p) };
        }
        let before = mapped(&xm);

        let again = (0..5_000).map(|_| xm.allocate(16)).collect::<Vec<_>>();
        assert_eq!(mapped(&xm), before);

        for (i, p) in ptrs.iter().enumerate().skip(1).step_by(2) {
            assert!(verify(*p, 16, i as u8));
        }
        xm.check().unwrap();

        for p in again.into_iter().chain(ptrs.into_iter().skip(1).step_by(2)) {
            unsafe { xm.free(p) };
        }
        assert_eq!(xm.counters().allocation_count, 0);
    }

    #[test]
    fn freed_page_comes_back_from_the_cache() {
        let xm = xmalloc(config());
        let page = xm.vmm().geometry().size();

        let a = xm.page_alloc(page);
        unsafe { xm.page_free(a, page) };
        let hits = xm.counters().cache_hits;
        let b = xm.page_alloc(page);
        assert_eq!(a, b);
        assert_eq!(xm.counters().cache_hits, hits + 1);
        unsafe { xm.page_free(b, page) };
    }

    #[test]
    fn shrink_then_grow_stays_in_place() {
        let xm = xmalloc(config());

        let a = xm.allocate(1000);
        scribble(a, 100, 7);

        let b = unsafe { xm.reallocate(Some(a), 100) }.unwrap();
        assert_eq!(a, b);
        let c = unsafe { xm.reallocate(Some(b), 1000) }.unwrap();
        assert_eq!(a, c);
        assert!(verify(c, 100, 7));
        assert!(unsafe { xm.usable_size(c) } >= 1000);

        unsafe { xm.free(c) };
        xm.check().unwrap();
    }

    #[test]
    fn page_block_grows_back_in_place() {
        let xm = xmalloc(config());

        let a = xm.allocate(100_000);
        scribble(a, 60_000, 6);

        let b = unsafe { xm.reallocate(Some(a), 60_000) }.unwrap();
        assert_eq!(a, b);
        let c = unsafe { xm.reallocate(Some(b), 100_000) }.unwrap();
        assert_eq!(a, c);
        assert!(verify(c, 60_000, 6));
        assert!(unsafe { xm.usable_size(c) } >= 100_000);
        scribble(c, 100_000, 8);

        assert_eq!(xm.counters().allocated_bytes, unsafe { xm.usable_size(c) } + HEADER_SIZE);
        unsafe { xm.free(c) };
        assert_eq!(xm.counters().allocated_bytes, 0);
        xm.check().unwrap();
    }

    #[test]
    fn aligned_page_block_keeps_neighbours_intact() {
        let xm = xmalloc(config());

        let before = xm.allocate(64);
        scribble(before, 64, 1);
        let p = xm.allocate_aligned(4096, 100);
        let after = xm.allocate(64);
        scribble(after, 64, 2);

        assert_eq!(p.as_ptr() as usize % 4096, 0);
        unsafe { p.as_ptr().write_bytes(0xCC, 100) };
        unsafe { xm.free(p) };

        assert!(verify(before, 64, 1));
        assert!(verify(after, 64, 2));
        xm.check().unwrap();
        unsafe {
            xm.free(before);
            xm.free(after);
        }
    }

    #[test]
    fn live_bytes_return_to_zero() {
        let xm = xmalloc(config());

        for size in [0, 1, 15, 16, 17, 500, 1024, 1025, 5000, MAXSIZE, MAXSIZE + 1, 200_000] {
            let p = xm.allocate(size);
            assert!(unsafe { xm.usable_size(p) } >= size);
            scribble(p, size, 3);
            unsafe { xm.free(p) };

            let c = xm.counters();
            assert_eq!(c.allocated_bytes, 0, "size {}", size);
            assert_eq!(c.allocation_count, 0);
        }
    }

    #[test]
    fn aligned_allocations_of_every_kind() {
        let xm = xmalloc(config());
        let page = xm.vmm().geometry().size();

        for (align, size) in [(8, 24), (32, 32), (64, 10), (256, 1000), (page, 100), (page, 3 * page), (4 * page, 10)] {
            let p = xm.allocate_aligned(align, size);
            assert_eq!(p.as_ptr() as usize % align, 0, "align {} size {}", align, size);
            assert!(unsafe { xm.usable_size(p) } >= size);
            scribble(p, size, 9);

            let q = unsafe { xm.reallocate(Some(p), size + 2 * page) }.unwrap();
            assert!(verify(q, size, 9));
            unsafe { xm.free(q) };
        }

        let c = xm.counters();
        assert_eq!(c.allocated_bytes, 0);
        assert_eq!(c.aligned_count, 0);
        xm.check().unwrap();
    }

    #[test]
    fn buckets_stay_homogeneous() {
        let xm = xmalloc(config());
        let mut rng = fastrand::Rng::with_seed(11);

        let ptrs = (0..2000).map(|_| xm.allocate(rng.usize(1..3000))).collect::<Vec<_>>();
        for p in ptrs.into_iter().filter(|_| rng.bool()) {
            unsafe { xm.free(p) };
        }

        xm.freelist.visit(|addr, size| {
            assert_eq!(unsafe { BlockHandle::read_free_tag(addr) }, size);
        });
        xm.check().unwrap();
    }

    #[test]
    fn realloc_edge_cases() {
        let xm = xmalloc(config());

        let p = unsafe { xm.reallocate(None, 40) }.unwrap();
        assert_eq!(unsafe { xm.reallocate(Some(p), 40) }, Some(p));
        assert_eq!(unsafe { xm.reallocate(Some(p), 0) }, None);
        assert_eq!(xm.counters().allocation_count, 0);

        // pages shrink in place; growing moves only when the next pages are taken
        let big = xm.allocate(4 * MAXSIZE);
        scribble(big, 64, 5);
        let smaller = unsafe { xm.reallocate(Some(big), 2 * MAXSIZE) }.unwrap();
        assert_eq!(big, smaller);
        let bigger = unsafe { xm.reallocate(Some(smaller), 8 * MAXSIZE) }.unwrap();
        assert!(verify(bigger, 64, 5));
        let small = unsafe { xm.reallocate(Some(bigger), 64) }.unwrap();
        assert!(verify(small, 64, 5));
        unsafe { xm.free(small) };
        assert_eq!(xm.counters().allocated_bytes, 0);
    }

    #[test]
    fn zeroed_allocations() {
        let xm = xmalloc(config());

        let p = xm.allocate(256);
        unsafe { p.as_ptr().write_bytes(0xFF, 256) };
        unsafe { xm.free(p) };

        let z = xm.allocate_array_zeroed(16, 16);
        assert!(unsafe { core::slice::from_raw_parts(z.as_ptr(), 256) }.iter().all(|&b| b == 0));
        unsafe { xm.free(z) };
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn array_overflow_is_fatal() {
        let xm = xmalloc(config());
        xm.allocate_array_zeroed(usize::MAX / 2, 3);
    }

    #[test]
    #[should_panic(expected = "block freed twice")]
    fn double_free_is_fatal() {
        let xm = xmalloc(config());
        let a = xm.allocate(48);
        let _keep = xm.allocate(48);
        unsafe {
            xm.free(a);
            xm.free(a);
        }
    }

    #[test]
    fn collector_releases_only_fully_free_pages() {
        // every free counts as a burst, so freed blocks stay 1 KiB
        let xm = xmalloc(config().with_burst_threshold(0));
        let page = xm.vmm().geometry().size();

        // fill a handful of pages with 1 KiB blocks, keep one block alive
        let blocks = (0..8 * page / 1024).map(|_| xm.allocate(1024 - HEADER_SIZE)).collect::<Vec<_>>();
        let survivor = blocks[blocks.len() / 2];
        scribble(survivor, 1024 - HEADER_SIZE, 4);

        for p in blocks.iter().copied().filter(|&p| p != survivor) {
            unsafe { xm.free(p) };
        }

        let report = xm.collect().unwrap();
        assert!(report.blocks_scanned > 0);
        assert!(report.pages_released > 0);
        assert!(verify(survivor, 1024 - HEADER_SIZE, 4));
        xm.check().unwrap();

        // rate limited until the period has passed
        assert!(xm.collect().is_none());
        xm.vmm().clock().advance(xm.config().xgc_period_ms);
        assert!(xm.collect().is_some());

        assert_eq!(xm.counters().xgc_runs, 2);
        unsafe { xm.free(survivor) };
    }

    #[test]
    fn boot_heap_serves_before_init() {
        let xm = std::boxed::Box::new(XMalloc::new(
            TestSource::new(),
            ManualClock::new(0),
            config().with_lazy_init(false),
        ));

        let early = xm.allocate(100);
        scribble(early, 100, 6);
        let aligned = xm.allocate_aligned(64, 100);
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
        assert!(xm.counters().boot_bytes > 0);
        assert_eq!(xm.counters().mapped_bytes, 0);

        let grown = unsafe { xm.reallocate(Some(aligned), 5000) }.unwrap();
        assert_eq!(grown, aligned);

        xm.init();
        let late = xm.allocate(100);
        assert!(xm.counters().mapped_bytes > 0);

        assert!(verify(early, 100, 6));
        unsafe {
            xm.free(early);
            xm.free(grown);
            xm.free(late);
        }
        assert_eq!(xm.counters().boot_bytes, 0);
        assert_eq!(xm.vmm().source().heap_used(), 0);
    }

    #[test]
    fn lazy_init_on_first_allocation() {
        let xm = std::boxed::Box::new(XMalloc::new(TestSource::new(), ManualClock::new(0), config()));
        let p = xm.allocate(10);
        assert!(xm.counters().mapped_bytes > 0);
        assert_eq!(xm.vmm().source().heap_used(), 0);
        unsafe { xm.free(p) };
    }

    #[test]
    fn shutdown_flushes_and_ignores_frees() {
        let xm = xmalloc(config());
        let page = xm.vmm().geometry().size();

        let a = xm.page_alloc(page);
        let b = xm.allocate(100);
        let cached = xm.counters().cached_pages;
        unsafe { xm.page_free(a, page) };
        assert_eq!(xm.counters().cached_pages, cached + 1);

        xm.shutdown();
        assert_eq!(xm.counters().cached_pages, 0);

        unsafe { xm.free(b) };
        assert_eq!(xm.counters().allocation_count, 1);
    }

    #[test]
    fn dump_mentions_every_part() {
        let xm = xmalloc(config());
        let p = xm.allocate(100);
        let z = xm.allocate_aligned(128, 64);

        let mut out = std::string::String::new();
        xm.dump(&mut out).unwrap();
        assert!(out.contains("buckets:"));
        assert!(out.contains("zone"));
        assert!(out.contains("local region map:"));

        unsafe {
            xm.free(p);
            xm.free(z);
        }
    }

    #[test]
    fn bursts_of_frees_skip_coalescing() {
        let xm = xmalloc(config().with_burst_threshold(8));

        let ptrs = (0..64).map(|_| xm.allocate(48)).collect::<Vec<_>>();
        for p in ptrs {
            unsafe { xm.free(p) };
        }

        // once the burst started, 64-byte blocks were filed without merging
        assert!(xm.freelist.bucket_count(bucket_for(64)) >= 64 - 8 - 1);
        xm.check().unwrap();
    }

    #[test]
    fn random_workload_stays_consistent() {
        let xm = xmalloc(config().with_burst_threshold(64));
        let mut rng = fastrand::Rng::with_seed(0xA110C);
        let page = xm.vmm().geometry().size();
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for round in 0..20_000 {
            match rng.u8(..10) {
                0..=3 => {
                    let size = match rng.u8(..8) {
                        0 => rng.usize(MAXSIZE..4 * MAXSIZE),
                        1..=2 => rng.usize(FACTOR..MAXSIZE),
                        _ => rng.usize(..FACTOR),
                    };
                    let p = xm.allocate(size);
                    scribble(p, size, round as u8);
                    live.push((p, size, round as u8));
                }
                4 => {
                    let align = 1 << rng.u32(4..14);
                    let size = rng.usize(..2 * page);
                    let p = xm.allocate_aligned(align, size);
                    assert_eq!(p.as_ptr() as usize % align, 0);
                    scribble(p, size, round as u8);
                    live.push((p, size, round as u8));
                }
                5..=6 if !live.is_empty() => {
                    let i = rng.usize(..live.len());
                    let (p, size, seed) = live[i];
                    let new_size = rng.usize(1..3 * size.max(16));
                    let q = unsafe { xm.reallocate(Some(p), new_size) }.unwrap();
                    assert!(verify(q, size.min(new_size), seed));
                    scribble(q, new_size, seed);
                    live[i] = (q, new_size, seed);
                }
                _ if !live.is_empty() => {
                    let (p, size, seed) = live.swap_remove(rng.usize(..live.len()));
                    assert!(verify(p, size, seed));
                    unsafe { xm.free(p) };
                }
                _ => {}
            }

            if round % 1000 == 0 {
                xm.check().unwrap();
                xm.vmm().clock().advance(1500);
                xm.collect();
            }
        }

        for (p, size, seed) in live {
            assert!(verify(p, size, seed));
            unsafe { xm.free(p) };
        }
        xm.check().unwrap();
        assert_eq!(xm.counters().allocated_bytes, 0);
    }

    const FACTOR: usize = crate::quantize::FACTOR_MAXSIZE;

    #[test]
    fn concurrent_threads_share_the_heap() {
        let xm = xmalloc(config());

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let xm = &xm;
                s.spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(t as u64);
                    let mut mine = Vec::new();
                    for i in 0..5000 {
                        if rng.bool() || mine.is_empty() {
                            let size = rng.usize(1..2048);
                            let p = xm.allocate(size);
                            scribble(p, size, t.wrapping_add(i as u8));
                            mine.push((p.as_ptr() as usize, size, t.wrapping_add(i as u8)));
                        } else {
                            let (p, size, seed) = mine.swap_remove(rng.usize(..mine.len()));
                            let p = NonNull::new(p as *mut u8).unwrap();
                            assert!(verify(p, size, seed));
                            unsafe { xm.free(p) };
                        }
                    }
                    for (p, _, _) in mine {
                        unsafe { xm.free(NonNull::new(p as *mut u8).unwrap()) };
                    }
                });
            }
        });

        xm.check().unwrap();
        assert_eq!(xm.counters().allocated_bytes, 0);
    }
}
