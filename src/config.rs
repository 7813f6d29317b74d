//! Runtime tuning for an [`XMalloc`](crate::XMalloc) instance.

/// Which way new mappings are placed relative to the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// New regions are placed above the base, free blocks at lower addresses are preferred.
    Increasing,
    /// New regions are placed below the base, free blocks at higher addresses are preferred.
    Decreasing,
}

/// Allocator configuration.
///
/// Build it in a `const` context and pass it to
/// [`XMalloc::new`](crate::XMalloc::new).
///
/// ```
/// use xmalloc::{Config, Growth};
///
/// const CONFIG: Config = Config::new()
///     .with_growth(Growth::Increasing)
///     .with_cache_lifetimes(30_000, 90_000);
/// assert_eq!(CONFIG.cache_soft_lifetime_ms, 30_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub growth: Growth,

    /// Cached pages older than this are unmapped unless they help coalescing.
    pub cache_soft_lifetime_ms: u64,
    /// Cached pages older than this are always unmapped.
    pub cache_hard_lifetime_ms: u64,
    /// Minimum time between two cache reclaim passes.
    pub cache_reclaim_interval_ms: u64,

    /// Minimum time between two fragmentation collector runs.
    pub xgc_period_ms: u64,

    /// Frees per second above which the freelist switches to burst mode.
    pub burst_threshold: usize,
    /// Bucket population above which page-divisor blocks stop being coalesced.
    pub keep_threshold: usize,
    /// Minimum time between two storage shrinks of the same bucket.
    pub bucket_shrink_period_ms: u64,

    /// Tell the OS it may discard the contents of cached pages.
    pub invalidate_cached: bool,
    /// Track the OS-reported process map in addition to the local view.
    pub load_kernel_map: bool,
    /// Initialize on first allocation instead of waiting for
    /// [`XMalloc::init`](crate::XMalloc::init).
    pub lazy_init: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            growth: Growth::Decreasing,
            cache_soft_lifetime_ms: 60_000,
            cache_hard_lifetime_ms: 180_000,
            cache_reclaim_interval_ms: 1_000,
            xgc_period_ms: 1_000,
            burst_threshold: 4096,
            keep_threshold: 256,
            bucket_shrink_period_ms: 1_000,
            invalidate_cached: true,
            load_kernel_map: true,
            lazy_init: true,
        }
    }

    pub const fn with_growth(mut self, growth: Growth) -> Self {
        self.growth = growth;
        self
    }

    pub const fn with_cache_lifetimes(mut self, soft_ms: u64, hard_ms: u64) -> Self {
        assert!(soft_ms <= hard_ms, "soft cache lifetime exceeds the hard one");
        self.cache_soft_lifetime_ms = soft_ms;
        self.cache_hard_lifetime_ms = hard_ms;
        self
    }

    pub const fn with_cache_reclaim_interval(mut self, ms: u64) -> Self {
        self.cache_reclaim_interval_ms = ms;
        self
    }

    pub const fn with_xgc_period(mut self, ms: u64) -> Self {
        self.xgc_period_ms = ms;
        self
    }

    pub const fn with_burst_threshold(mut self, frees_per_second: usize) -> Self {
        self.burst_threshold = frees_per_second;
        self
    }

    pub const fn with_keep_threshold(mut self, blocks: usize) -> Self {
        self.keep_threshold = blocks;
        self
    }

    pub const fn with_bucket_shrink_period(mut self, ms: u64) -> Self {
        self.bucket_shrink_period_ms = ms;
        self
    }

    pub const fn with_invalidate_cached(mut self, invalidate: bool) -> Self {
        self.invalidate_cached = invalidate;
        self
    }

    pub const fn with_kernel_map(mut self, load: bool) -> Self {
        self.load_kernel_map = load;
        self
    }

    pub const fn with_lazy_init(mut self, lazy: bool) -> Self {
        self.lazy_init = lazy;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
