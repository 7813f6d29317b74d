//! The page layer: page-granular allocation on top of a [`PageSource`].
//!
//! Allocation tries the page cache, then maps fresh memory at a hint taken
//! from the region maps, so that the allocator's mappings stay packed next to
//! each other. Every mapping is recorded in the local region map, and in the
//! OS-reported one when it is loaded.
//!
//! Nothing in here logs: the page layer is reached with freelist locks held,
//! and a logger may allocate. Deferred messages are flushed by
//! [`Vmm::maintain`], which callers invoke once they hold nothing.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    cache::{Evicted, PageCache, CACHE_LINES},
    clock::{Clock, RateLimit},
    config::Config,
    corevec::CoreMemory,
    crash::{fatal, Diagnostics},
    error::Inconsistency,
    page::{PageGeometry, SharedGeometry},
    pmap::{RegionKind, RegionMap},
    source::{MapLoadError, PageSource, Protection},
    stats::{Counters, Usage, VmmStats},
};

/// Longest hinted range whose occupied pages are told apart one by one.
const MAX_TESTED_PAGES: usize = 16;

/// Page allocator with region tracking and a page cache.
pub struct Vmm<S: PageSource, C: Clock> {
    source: S,
    clock: C,
    config: Config,
    geometry: SharedGeometry,
    /// Address of the first mapping, from which holes are searched.
    base: AtomicUsize,

    local: RegionMap,
    kernel: RegionMap,
    cache: PageCache,

    stats: VmmStats,
    reclaim_limit: RateLimit,

    kernel_load_failed: AtomicBool,
    kernel_load_warned: AtomicBool,
    hints_reported: AtomicU64,
}

impl<S: PageSource, C: Clock> Vmm<S, C> {
    pub const fn new(source: S, clock: C, config: Config) -> Self {
        Self {
            source,
            clock,
            config,
            geometry: SharedGeometry::new(),
            base: AtomicUsize::new(0),
            local: RegionMap::new(),
            kernel: RegionMap::new(),
            cache: PageCache::new(),
            stats: VmmStats::new(),
            reclaim_limit: RateLimit::new(),
            kernel_load_failed: AtomicBool::new(false),
            kernel_load_warned: AtomicBool::new(false),
            hints_reported: AtomicU64::new(0),
        }
    }

    /// Detects the page size and, if configured, loads the OS process map.
    pub(crate) fn init(&self) {
        self.geometry.set(PageGeometry::new(self.source.page_size()));

        if self.config.load_kernel_map {
            if let Err(e) = self.reload_kernel_map() {
                self.kernel_load_failed.store(true, Ordering::Relaxed);
                self.warn_kernel_load(e);
            }
        }
    }

    #[inline]
    pub fn geometry(&self) -> PageGeometry {
        self.geometry.get()
    }

    #[inline]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }

    #[inline]
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The map the allocator trusts for free address space.
    fn hole_map(&self) -> &RegionMap {
        if self.kernel.is_loaded() {
            &self.kernel
        } else {
            &self.local
        }
    }

    /// The allocator's own view of the address space.
    pub fn local_map(&self) -> &RegionMap {
        &self.local
    }

    /// The OS-reported view of the address space, if loaded.
    pub fn kernel_map(&self) -> Option<&RegionMap> {
        self.kernel.is_loaded().then_some(&self.kernel)
    }

    /// Reloads the OS process map, then records the allocator's own mappings
    /// in it as native again.
    fn reload_kernel_map(&self) -> Result<u64, MapLoadError> {
        let now = self.now();
        let generation = self.kernel.reload(self, &|sink| self.source.load_map(sink), now)?;

        // one fragment at a time: overruling may extend either map
        let mut cursor = 0;
        while let Some(frag) = self.local.next_native(cursor) {
            self.kernel.overrule(self, frag.start, frag.len(), RegionKind::Native, now);
            cursor = frag.end;
        }

        Ok(generation)
    }

    fn warn_kernel_load(&self, e: MapLoadError) {
        if !self.kernel_load_warned.swap(true, Ordering::Relaxed) {
            log::warn!("xmalloc: {}, relying on the local region map", e);
        }
    }

    /// Returns `len` bytes (rounded up to pages) of user memory.
    ///
    /// Aborts the process if the OS refuses to map more memory.
    pub fn alloc(&self, len: usize) -> NonNull<u8> {
        self.alloc_pages(len, Usage::User).0
    }

    /// Like [`Vmm::alloc`], but the memory is zeroed.
    pub fn alloc_zeroed(&self, len: usize) -> NonNull<u8> {
        let (ptr, fresh) = self.alloc_pages(len, Usage::User);
        if !fresh {
            unsafe { ptr.as_ptr().write_bytes(0, self.geometry().round_up(len)) };
        }
        ptr
    }

    /// Returns pages obtained from [`Vmm::alloc`].
    ///
    /// # Safety
    /// `ptr..ptr + len` must be page memory from this allocator, no longer in use.
    /// Sub-ranges of one allocation may be freed separately.
    pub unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        self.free_pages(ptr.as_ptr() as usize, len, Usage::User);
    }

    /// Releases the pages past `new_len`. Never moves the allocation.
    ///
    /// # Safety
    /// See [`Vmm::free`].
    pub unsafe fn shrink(&self, ptr: NonNull<u8>, old_len: usize, new_len: usize) {
        let geo = self.geometry();
        let (old_len, new_len) = (geo.round_up(old_len), geo.round_up(new_len));

        if new_len < old_len {
            self.free_pages(ptr.as_ptr() as usize + new_len, old_len - new_len, Usage::User);
        }
    }

    /// Changes the protection of page memory.
    ///
    /// # Safety
    /// The range must be page memory from this allocator.
    pub unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, prot: Protection) -> bool {
        self.source.protect(ptr, self.geometry().round_up(len), prot)
    }

    /// Records a mapping the client made itself, so no hint is proposed over it.
    pub fn note_client_mapping(&self, start: usize, len: usize) {
        let now = self.now();
        self.local.overrule(self, start, len, RegionKind::Mapped, now);
        if self.kernel.is_loaded() {
            self.kernel.overrule(self, start, len, RegionKind::Mapped, now);
        }
    }

    /// Forgets a mapping recorded with [`Vmm::note_client_mapping`].
    pub fn note_client_unmapping(&self, start: usize, len: usize) {
        self.local.remove(self, start, len);
        if self.kernel.is_loaded() {
            self.kernel.remove(self, start, len);
        }
    }

    /// Extends the page allocation at `ptr` from `old_len` to `new_len`
    /// without moving it. Returns whether the pages right after it could be had.
    ///
    /// # Safety
    /// `ptr..ptr + old_len` must be page memory from [`Vmm::alloc`].
    pub unsafe fn grow(&self, ptr: NonNull<u8>, old_len: usize, new_len: usize) -> bool {
        let geo = self.geometry();
        let (old_len, new_len) = (geo.round_up(old_len), geo.round_up(new_len));
        if new_len <= old_len {
            return true;
        }

        let tail = ptr.as_ptr() as usize + old_len;
        let extra = new_len - old_len;
        let now = self.now();

        let (taken, evicted) = self.cache.take_at(tail, geo.pages(extra), geo);
        self.release_evicted(evicted);

        if taken {
            self.stats.account_uncached(geo.pages(extra));
            self.stats.account_cache_hit();
        } else if !self.map_at(tail, extra, now) {
            return false;
        }

        self.stats.account_alloc(Usage::User, extra);
        true
    }

    /// Maps `len` bytes at exactly `addr`, if nothing is there.
    fn map_at(&self, addr: usize, len: usize, now: u64) -> bool {
        let Some(ptr) = self.source.map(NonNull::new(addr as *mut u8), len) else {
            return false;
        };

        if ptr.as_ptr() as usize != addr {
            // SAFETY: just mapped, never handed out
            unsafe { self.source.unmap(ptr, len) };
            return false;
        }

        self.stats.account_map(len);
        self.local.overrule(self, addr, len, RegionKind::Native, now);
        if self.kernel.is_loaded() {
            self.kernel.overrule(self, addr, len, RegionKind::Native, now);
        }
        true
    }

    /// Returns page memory and whether it is known to be zeroed.
    pub(crate) fn alloc_pages(&self, len: usize, usage: Usage) -> (NonNull<u8>, bool) {
        let geo = self.geometry();
        let len = geo.round_up(len.max(1));
        let now = self.now();

        let (hit, evicted) = self.cache.find(geo.pages(len), geo, self.config.growth, now);
        self.release_evicted(evicted);

        if let Some(base) = hit {
            self.stats.account_uncached(geo.pages(len));
            self.stats.account_cache_hit();
            self.stats.account_alloc(usage, len);
            // SAFETY: cached runs are never at address zero
            return (unsafe { NonNull::new_unchecked(base as *mut u8) }, false);
        }

        self.stats.account_cache_miss();
        let ptr = self.map_fresh(len, now);
        self.stats.account_alloc(usage, len);
        (ptr, true)
    }

    fn map_fresh(&self, len: usize, now: u64) -> NonNull<u8> {
        let base = self.base.load(Ordering::Relaxed);
        let hint = match base {
            0 => None,
            _ => self.hole_map().find_hole(len, base, self.config.growth),
        };

        let mapped = self
            .source
            .map(hint.and_then(|h| NonNull::new(h as *mut u8)), len)
            .or_else(|| hint.and_then(|_| self.source.map(None, len)));

        let Some(ptr) = mapped else {
            fatal!(Some(self), "out of virtual memory while mapping {} bytes", len);
        };

        let addr = ptr.as_ptr() as usize;

        if let Some(hint) = hint.filter(|&h| h != addr) {
            self.reconcile_ignored_hint(hint, len, now);
        }

        let _ = self.base.compare_exchange(0, addr, Ordering::Relaxed, Ordering::Relaxed);

        self.stats.account_map(len);
        self.local.overrule(self, addr, len, RegionKind::Native, now);
        if self.kernel.is_loaded() {
            self.kernel.overrule(self, addr, len, RegionKind::Native, now);
        }

        ptr
    }

    /// Something the maps did not know about occupies (part of) the hinted range.
    fn reconcile_ignored_hint(&self, hint: usize, len: usize, now: u64) {
        self.stats.account_hint_ignored();

        if self.config.load_kernel_map {
            match self.reload_kernel_map() {
                Ok(_) => return,
                Err(_) => self.kernel_load_failed.store(true, Ordering::Relaxed),
            }
        }

        self.mark_occupied(hint, len, now);
    }

    /// Records as foreign the unrecorded pages of `start..start + len` the OS
    /// will not map at. Ranges longer than `MAX_TESTED_PAGES` are recorded whole.
    fn mark_occupied(&self, start: usize, len: usize, now: u64) {
        let geo = self.geometry();
        let page = geo.size();

        if geo.pages(len) > MAX_TESTED_PAGES {
            self.local.fill_gaps(self, start, len, RegionKind::Foreign, now);
            return;
        }

        for addr in (start..start + len).step_by(page) {
            if self.local.lookup(addr).is_some() {
                continue;
            }

            let taken = match self.source.map(NonNull::new(addr as *mut u8), page) {
                Some(ptr) => {
                    // SAFETY: just mapped, never handed out
                    unsafe { self.source.unmap(ptr, page) };
                    ptr.as_ptr() as usize != addr
                }
                None => true,
            };

            if taken {
                self.local.fill_gaps(self, addr, page, RegionKind::Foreign, now);
            }
        }
    }

    /// Whether freeing `addr..addr + len` leaves a mapping that can never
    /// coalesce, judged by the most complete map at hand.
    fn is_isolated(&self, addr: usize, len: usize) -> bool {
        self.hole_map().is_isolated(addr, len)
    }

    pub(crate) fn free_pages(&self, addr: usize, len: usize, usage: Usage) {
        let geo = self.geometry();
        let len = geo.round_up(len);
        let pages = geo.pages(len);
        self.stats.account_free(usage, len);

        if pages > CACHE_LINES || self.is_isolated(addr, len) {
            self.unmap(addr, len);
            return;
        }

        if self.config.invalidate_cached {
            // SAFETY: page memory owned by the allocator
            let ok = unsafe {
                self.source.invalidate(NonNull::new_unchecked(addr as *mut u8), len)
            };
            if !ok {
                self.unmap(addr, len);
                return;
            }
        }

        self.stats.account_cached(pages);
        let evicted = self.cache.insert(addr, pages, geo, self.now());
        self.release_evicted(evicted);
    }

    fn release_evicted(&self, evicted: Evicted) {
        let geo = self.geometry();
        for (base, pages) in evicted.iter() {
            self.stats.account_uncached(pages);
            self.unmap(base, geo.bytes(pages));
        }
    }

    fn unmap(&self, addr: usize, len: usize) {
        // SAFETY: only ever called on page runs this allocator mapped and no longer hands out
        unsafe { self.source.unmap(NonNull::new_unchecked(addr as *mut u8), len) };

        self.stats.account_unmap(len);
        self.local.remove(self, addr, len);
        if self.kernel.is_loaded() {
            self.kernel.remove(self, addr, len);
        }
    }

    /// Unmaps cached runs that outlived their lifetime, at most once per
    /// reclaim interval, and flushes deferred log messages.
    ///
    /// Must be called without any allocator lock held.
    pub(crate) fn maintain(&self) {
        let now = self.now();

        if self.reclaim_limit.try_begin(now, self.config.cache_reclaim_interval_ms) {
            let released = self.reclaim_at(now);
            if released != 0 {
                log::debug!("xmalloc: unmapped {} expired cached pages", released);
            }

            let ignored = self.stats_snapshot().hints_ignored;
            let reported = self.hints_reported.swap(ignored, Ordering::Relaxed);
            if ignored > reported {
                log::debug!("xmalloc: {} mapping hints ignored by the OS", ignored - reported);
            }
        }

        if self.kernel_load_failed.load(Ordering::Relaxed) {
            self.warn_kernel_load(MapLoadError::Unreadable);
        }
    }

    /// Releases every cached run past its hard lifetime, and every run past
    /// its soft lifetime unless it borders pages still in use.
    pub(crate) fn reclaim_at(&self, now: u64) -> usize {
        let geo = self.geometry();
        let soft = self.config.cache_soft_lifetime_ms;
        let hard = self.config.cache_hard_lifetime_ms;
        let mut released = 0;

        self.cache.reclaim(
            now,
            |base, pages, age| {
                age >= hard || (age >= soft && !self.borders_live_pages(base, geo.bytes(pages)))
            },
            |base, pages| {
                self.stats.account_uncached(pages);
                self.unmap(base, geo.bytes(pages));
                released += pages;
            },
        );

        released
    }

    /// Whether the native fragment holding `base..base + len` extends past it.
    fn borders_live_pages(&self, base: usize, len: usize) -> bool {
        self.local.lookup(base).map_or(false, |f| f.kind == RegionKind::Native && f.len() > len)
    }

    /// Returns every cached page to the OS.
    pub(crate) fn flush(&self) -> usize {
        let geo = self.geometry();
        let mut released = 0;

        self.cache.reclaim(
            self.now(),
            |_, _, _| true,
            |base, pages| {
                self.stats.account_uncached(pages);
                self.unmap(base, geo.bytes(pages));
                released += pages;
            },
        );

        released
    }

    pub(crate) fn fill_counters(&self, c: &mut Counters) {
        self.stats.fill(c);
    }

    fn stats_snapshot(&self) -> Counters {
        let mut c = Counters::default();
        self.stats.fill(&mut c);
        c
    }

    /// Number of pages currently held by the page cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.pages()
    }

    pub fn check(&self) -> Result<(), Inconsistency> {
        self.local.check()?;
        if self.kernel.is_loaded() {
            self.kernel.check()?;
        }
        self.cache.check()
    }

    /// Writes the region maps and cache occupancy.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "local region map:")?;
        self.local.dump(w)?;
        if self.kernel.is_loaded() {
            writeln!(w, "kernel region map:")?;
            self.kernel.dump(w)?;
        }
        writeln!(w, "page cache:")?;
        self.cache.dump(w)
    }
}

impl<S: PageSource, C: Clock> CoreMemory for Vmm<S, C> {
    fn page_size(&self) -> usize {
        self.geometry().size()
    }

    fn alloc_core(&self, len: usize) -> NonNull<u8> {
        let (ptr, fresh) = self.alloc_pages(len, Usage::Core);
        if !fresh {
            unsafe { ptr.as_ptr().write_bytes(0, self.geometry().round_up(len)) };
        }
        ptr
    }

    unsafe fn free_core(&self, ptr: NonNull<u8>, len: usize) {
        self.free_pages(ptr.as_ptr() as usize, len, Usage::Core);
    }
}

impl<S: PageSource, C: Clock> Diagnostics for Vmm<S, C> {
    fn report(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "{}", self.stats_snapshot())?;
        self.dump(w)
    }
}

/// Unmaps everything the allocator mapped, cached pages and metadata included.
impl<S: PageSource, C: Clock> Drop for Vmm<S, C> {
    fn drop(&mut self) {
        let source = &self.source;
        self.local.drain_native(|start, len| {
            // SAFETY: native fragments are mappings owned by this allocator
            unsafe { source.unmap(NonNull::new_unchecked(start as *mut u8), len) }
        });
    }
}

impl<S: PageSource, C: Clock> fmt::Debug for Vmm<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmm")
            .field("geometry", &self.geometry())
            .field("base", &(self.base.load(Ordering::Relaxed) as *const u8))
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
