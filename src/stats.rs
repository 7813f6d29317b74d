//! Track allocation statistics for both layers.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};

/// A snapshot of the allocator's statistics.
///
/// # Example
///
/// ```
/// # use xmalloc::{Config, ManualClock, XMalloc, source::UnixMMapSource};
/// let xm = XMalloc::new(UnixMMapSource::new(), ManualClock::new(0), Config::new().with_kernel_map(false));
/// xm.init();
/// let counters = xm.counters();
/// assert_eq!(counters.allocation_count, 0);
/// eprintln!("{}", counters);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of live heap allocations.
    pub allocation_count: usize,
    /// Total number of heap allocations.
    pub total_allocation_count: u64,
    /// Physical bytes of live heap allocations, headers included.
    pub allocated_bytes: usize,
    /// Physical bytes of all heap allocations ever made.
    pub total_allocated_bytes: u64,
    /// Bytes currently reserved by the bootstrap heap.
    pub boot_bytes: usize,
    /// Number of live allocations with an alignment above the default.
    pub aligned_count: usize,

    /// Bytes currently mapped by the page layer, cached pages included.
    pub mapped_bytes: usize,
    /// Bytes ever mapped by the page layer.
    pub total_mapped_bytes: u64,
    /// Bytes of pages handed out as user memory.
    pub user_page_bytes: usize,
    /// Number of user page allocations.
    pub total_user_page_allocs: u64,
    /// Bytes of pages holding allocator metadata.
    pub core_bytes: usize,
    /// Number of metadata page allocations.
    pub total_core_allocs: u64,
    /// Pages held by the page cache.
    pub cached_pages: usize,
    /// Page allocations served by the page cache.
    pub cache_hits: u64,
    /// Page allocations that had to map fresh memory.
    pub cache_misses: u64,
    /// Mappings placed somewhere other than the hinted address.
    pub hints_ignored: u64,

    /// Fragmentation collector runs.
    pub xgc_runs: u64,
    /// Pages released by the fragmentation collector.
    pub xgc_released_pages: u64,
}

impl Counters {
    /// Returns the number of heap bytes that have been freed.
    #[inline]
    pub const fn total_freed_bytes(&self) -> u64 {
        self.total_allocated_bytes - self.allocated_bytes as u64
    }

    /// Returns the number of bytes that were mapped and since returned to the OS.
    #[inline]
    pub const fn total_unmapped_bytes(&self) -> u64 {
        self.total_mapped_bytes - self.mapped_bytes as u64
    }
}

impl core::fmt::Display for Counters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"Stat                 | Current Total       | Accumulative Total
---------------------|---------------------|--------------------
# of Allocations     | {:>19} | {:>19}
# of Allocated Bytes | {:>19} | {:>19}
# of Boot Bytes      | {:>19} |                 N/A
# of Aligned Allocs  | {:>19} |                 N/A
# of Mapped Bytes    | {:>19} | {:>19}
# of User Page Bytes | {:>19} | {:>19}
# of Core Bytes      | {:>19} | {:>19}
# of Cached Pages    | {:>19} |                 N/A
# of Cache Hits      |                 N/A | {:>19}
# of Cache Misses    |                 N/A | {:>19}
# of Ignored Hints   |                 N/A | {:>19}
# of Collector Runs  |                 N/A | {:>19}
# of Collected Pages |                 N/A | {:>19}"#,
            self.allocation_count,
            self.total_allocation_count,
            self.allocated_bytes,
            self.total_allocated_bytes,
            self.boot_bytes,
            self.aligned_count,
            self.mapped_bytes,
            self.total_mapped_bytes,
            self.user_page_bytes,
            self.total_user_page_allocs,
            self.core_bytes,
            self.total_core_allocs,
            self.cached_pages,
            self.cache_hits,
            self.cache_misses,
            self.hints_ignored,
            self.xgc_runs,
            self.xgc_released_pages,
        )
    }
}

/// Page layer counters.
#[derive(Debug)]
pub(crate) struct VmmStats {
    mapped_bytes: AtomicUsize,
    total_mapped_bytes: AtomicU64,
    user_page_bytes: AtomicUsize,
    total_user_page_allocs: AtomicU64,
    core_bytes: AtomicUsize,
    total_core_allocs: AtomicU64,
    cached_pages: AtomicUsize,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    hints_ignored: AtomicU64,
}

/// Whether pages serve user data or allocator metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Usage {
    User,
    Core,
}

impl VmmStats {
    pub const fn new() -> Self {
        Self {
            mapped_bytes: AtomicUsize::new(0),
            total_mapped_bytes: AtomicU64::new(0),
            user_page_bytes: AtomicUsize::new(0),
            total_user_page_allocs: AtomicU64::new(0),
            core_bytes: AtomicUsize::new(0),
            total_core_allocs: AtomicU64::new(0),
            cached_pages: AtomicUsize::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            hints_ignored: AtomicU64::new(0),
        }
    }

    pub fn account_map(&self, len: usize) {
        self.mapped_bytes.fetch_add(len, Relaxed);
        self.total_mapped_bytes.fetch_add(len as u64, Relaxed);
    }

    pub fn account_unmap(&self, len: usize) {
        self.mapped_bytes.fetch_sub(len, Relaxed);
    }

    pub fn account_alloc(&self, usage: Usage, len: usize) {
        match usage {
            Usage::User => {
                self.user_page_bytes.fetch_add(len, Relaxed);
                self.total_user_page_allocs.fetch_add(1, Relaxed);
            }
            Usage::Core => {
                self.core_bytes.fetch_add(len, Relaxed);
                self.total_core_allocs.fetch_add(1, Relaxed);
            }
        }
    }

    pub fn account_free(&self, usage: Usage, len: usize) {
        match usage {
            Usage::User => self.user_page_bytes.fetch_sub(len, Relaxed),
            Usage::Core => self.core_bytes.fetch_sub(len, Relaxed),
        };
    }

    pub fn account_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Relaxed);
    }

    pub fn account_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Relaxed);
    }

    pub fn account_cached(&self, pages: usize) {
        self.cached_pages.fetch_add(pages, Relaxed);
    }

    pub fn account_uncached(&self, pages: usize) {
        self.cached_pages.fetch_sub(pages, Relaxed);
    }

    pub fn account_hint_ignored(&self) {
        self.hints_ignored.fetch_add(1, Relaxed);
    }

    pub fn fill(&self, c: &mut Counters) {
        c.mapped_bytes = self.mapped_bytes.load(Relaxed);
        c.total_mapped_bytes = self.total_mapped_bytes.load(Relaxed);
        c.user_page_bytes = self.user_page_bytes.load(Relaxed);
        c.total_user_page_allocs = self.total_user_page_allocs.load(Relaxed);
        c.core_bytes = self.core_bytes.load(Relaxed);
        c.total_core_allocs = self.total_core_allocs.load(Relaxed);
        c.cached_pages = self.cached_pages.load(Relaxed);
        c.cache_hits = self.cache_hits.load(Relaxed);
        c.cache_misses = self.cache_misses.load(Relaxed);
        c.hints_ignored = self.hints_ignored.load(Relaxed);
    }
}

/// Heap layer counters.
#[derive(Debug)]
pub(crate) struct HeapStats {
    allocation_count: AtomicUsize,
    total_allocation_count: AtomicU64,
    allocated_bytes: AtomicUsize,
    total_allocated_bytes: AtomicU64,
    boot_bytes: AtomicUsize,
    aligned_count: AtomicUsize,
    xgc_runs: AtomicU64,
    xgc_released_pages: AtomicU64,
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            allocation_count: AtomicUsize::new(0),
            total_allocation_count: AtomicU64::new(0),
            allocated_bytes: AtomicUsize::new(0),
            total_allocated_bytes: AtomicU64::new(0),
            boot_bytes: AtomicUsize::new(0),
            aligned_count: AtomicUsize::new(0),
            xgc_runs: AtomicU64::new(0),
            xgc_released_pages: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn account_alloc(&self, len: usize) {
        self.allocation_count.fetch_add(1, Relaxed);
        self.total_allocation_count.fetch_add(1, Relaxed);
        self.allocated_bytes.fetch_add(len, Relaxed);
        self.total_allocated_bytes.fetch_add(len as u64, Relaxed);
    }

    #[inline]
    pub fn account_dealloc(&self, len: usize) {
        self.allocation_count.fetch_sub(1, Relaxed);
        self.allocated_bytes.fetch_sub(len, Relaxed);
    }

    #[inline]
    pub fn account_resize(&self, old_len: usize, new_len: usize) {
        if new_len > old_len {
            self.allocated_bytes.fetch_add(new_len - old_len, Relaxed);
            self.total_allocated_bytes.fetch_add((new_len - old_len) as u64, Relaxed);
        } else {
            self.allocated_bytes.fetch_sub(old_len - new_len, Relaxed);
        }
    }

    pub fn account_boot(&self, old_reserved: usize, new_reserved: usize) {
        if new_reserved > old_reserved {
            self.boot_bytes.fetch_add(new_reserved - old_reserved, Relaxed);
        } else {
            self.boot_bytes.fetch_sub(old_reserved - new_reserved, Relaxed);
        }
    }

    pub fn account_aligned(&self, live: bool) {
        if live {
            self.aligned_count.fetch_add(1, Relaxed);
        } else {
            self.aligned_count.fetch_sub(1, Relaxed);
        }
    }

    pub fn account_xgc(&self, released_pages: usize) {
        self.xgc_runs.fetch_add(1, Relaxed);
        self.xgc_released_pages.fetch_add(released_pages as u64, Relaxed);
    }

    pub fn fill(&self, c: &mut Counters) {
        c.allocation_count = self.allocation_count.load(Relaxed);
        c.total_allocation_count = self.total_allocation_count.load(Relaxed);
        c.allocated_bytes = self.allocated_bytes.load(Relaxed);
        c.total_allocated_bytes = self.total_allocated_bytes.load(Relaxed);
        c.boot_bytes = self.boot_bytes.load(Relaxed);
        c.aligned_count = self.aligned_count.load(Relaxed);
        c.xgc_runs = self.xgc_runs.load(Relaxed);
        c.xgc_released_pages = self.xgc_released_pages.load(Relaxed);
    }
}
