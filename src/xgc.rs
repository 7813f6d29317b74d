//! The fragmentation collector.
//!
//! Free blocks that together cover whole pages are taken out of the
//! freelist and those pages handed back to the page layer. Live data is
//! never moved: a page is released only if free blocks cover all of it,
//! and a block only if every page it touches is released.

use core::fmt;

use crate::{
    clock::{Clock, RateLimit},
    corevec::CoreBuf,
    freelist::Freelist,
    page::PageGeometry,
    source::PageSource,
    stats::Usage,
    vmm::Vmm,
};

/// Outcome of a collector pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XgcReport {
    /// Free blocks in the snapshot.
    pub blocks_scanned: usize,
    /// Pages touched by those blocks.
    pub pages_scanned: usize,
    pub pages_released: usize,
    /// Page runs left alone because a block was reused mid-pass.
    pub runs_skipped: usize,
}

impl fmt::Display for XgcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} free blocks over {} pages, released {} pages ({} runs skipped)",
            self.blocks_scanned, self.pages_scanned, self.pages_released, self.runs_skipped
        )
    }
}

/// A free block in the snapshot.
type Block = (usize, usize);

/// Room for blocks freed while the snapshot is being sized.
const SNAPSHOT_SLACK: usize = 64;

#[derive(Debug)]
pub(crate) struct Collector {
    limit: RateLimit,
}

impl Collector {
    pub const fn new() -> Self {
        Self { limit: RateLimit::new() }
    }

    /// Whether a pass is allowed at `now`. Claims the slot if so.
    pub fn due(&self, now: u64, period_ms: u64) -> bool {
        self.limit.try_begin(now, period_ms)
    }

    /// When the last pass started.
    pub fn last_run(&self) -> Option<u64> {
        self.limit.last()
    }

    /// Runs one pass. Must be called without allocator locks held.
    pub fn run<S: PageSource, C: Clock>(&self, freelist: &Freelist, vmm: &Vmm<S, C>) -> XgcReport {
        let geo = vmm.geometry();
        let (count, _) = freelist.totals();
        let mut report = XgcReport::default();

        if count == 0 {
            return report;
        }

        let mut scratch = CoreBuf::<Block>::alloc(vmm, count + SNAPSHOT_SLACK);
        let cap = scratch.cap();
        let mut len = 0;

        freelist.visit(|addr, size| {
            if len < cap {
                scratch.write(len, (addr, size));
                len += 1;
            }
        });

        // SAFETY: `len` entries were written
        let blocks = unsafe { scratch.slice_mut(len) };
        blocks.sort_unstable_by_key(|&(addr, _)| addr);
        report.blocks_scanned = len;

        let mut i = 0;
        while i < blocks.len() {
            let mut j = i + 1;
            while j < blocks.len() && blocks[j - 1].0 + blocks[j - 1].1 == blocks[j].0 {
                j += 1;
            }

            let chain = &blocks[i..j];
            let (start, end) = (chain[0].0, chain[j - i - 1].0 + chain[j - i - 1].1);
            report.pages_scanned += geo.pages(geo.round_up(end) - geo.round_down(start));

            if let Some((lo, hi)) = releasable(chain, geo) {
                if release_run(chain, lo, hi, freelist, vmm) {
                    report.pages_released += geo.pages(hi - lo);
                } else {
                    report.runs_skipped += 1;
                }
            }

            i = j;
        }

        // SAFETY: the snapshot is no longer referenced
        unsafe { scratch.free(vmm) };
        report
    }
}

/// The page range of a chain of adjacent free blocks that is tiled exactly
/// by blocks lying within fully free pages.
fn releasable(chain: &[Block], geo: PageGeometry) -> Option<(usize, usize)> {
    let start = chain[0].0;
    let last = chain[chain.len() - 1];

    let mut lo = geo.round_up(start);
    for &(addr, size) in chain {
        if addr >= lo {
            break;
        }
        if addr + size > lo {
            lo = geo.round_up(addr + size);
        }
    }

    let mut hi = geo.round_down(last.0 + last.1);
    for &(addr, size) in chain.iter().rev() {
        if addr + size <= hi {
            break;
        }
        if addr < hi {
            hi = geo.round_down(addr);
        }
    }

    (lo < hi).then_some((lo, hi))
}

/// Takes every block within `lo..hi` out of the freelist and releases the
/// pages. If one of them is gone, the taken ones are put back.
fn release_run<S: PageSource, C: Clock>(
    chain: &[Block],
    lo: usize,
    hi: usize,
    freelist: &Freelist,
    vmm: &Vmm<S, C>,
) -> bool {
    let run = chain.iter().filter(|&&(addr, size)| addr >= lo && addr + size <= hi);

    for (taken, &(addr, size)) in run.clone().enumerate() {
        if !freelist.take_exact(addr, size, vmm) {
            for &(addr, size) in run.take(taken) {
                freelist.file_pieces(addr, size, vmm);
            }
            return false;
        }
    }

    vmm.free_pages(lo, hi - lo, Usage::User);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, config::Config, test_utils::TestSource};

    const GEO: PageGeometry = PageGeometry::new(4096);

    fn vmm() -> std::boxed::Box<Vmm<TestSource, ManualClock>> {
        let vmm = std::boxed::Box::new(Vmm::new(
            TestSource::new(),
            ManualClock::new(0),
            Config::new().with_kernel_map(false),
        ));
        vmm.init();
        vmm
    }

    /// Files a chain over four pages at `mem`, whose first and last pages
    /// stay in use. The first block straddles into the second page.
    fn straddling_chain(fl: &Freelist, vmm: &Vmm<TestSource, ManualClock>, mem: usize) -> [Block; 5] {
        let page = vmm.geometry().size();
        let half = page / 2;
        let x = mem + page - 256;

        let chain = [
            (x, half),
            (x + half, 256),
            (mem + page + half, half),
            (mem + 2 * page, half),
            (mem + 2 * page + half, half),
        ];
        for &(addr, size) in &chain {
            fl.file_pieces(addr, size, vmm);
        }
        chain
    }

    #[test]
    fn whole_pages_inside_a_chain() {
        // 0x2000..0x4000 is free, but each block also covers part of a used page
        let chain = [(0x1800, 0x1000), (0x2800, 0x1800)];
        assert_eq!(releasable(&chain, GEO), None);

        let chain = [(0x1000, 0x800), (0x1800, 0x800), (0x2000, 0x2000), (0x4000, 0x100)];
        assert_eq!(releasable(&chain, GEO), Some((0x1000, 0x4000)));
    }

    #[test]
    fn straddling_blocks_pin_their_pages() {
        // the last block reaches into 0x4000, which is only partly free
        let chain = [(0x2000, 0x1000), (0x3000, 0x800), (0x3800, 0x1000)];
        assert_eq!(releasable(&chain, GEO), Some((0x2000, 0x3000)));

        // nothing is whole
        let chain = [(0x1010, 0x1000)];
        assert_eq!(releasable(&chain, GEO), None);
    }

    #[test]
    fn partly_free_page_is_kept_whole() {
        let vmm = vmm();
        let fl = Freelist::new(Config::new());
        let page = vmm.geometry().size();
        let half = page / 2;

        let mem = vmm.alloc(4 * page).as_ptr() as usize;
        straddling_chain(&fl, &vmm, mem);

        let report = Collector::new().run(&fl, &vmm);
        assert_eq!(report.blocks_scanned, 5);
        assert_eq!(report.pages_released, 1);
        assert_eq!(report.runs_skipped, 0);
        assert_eq!(vmm.cached_pages(), 1);

        // the second page is mostly free, but the straddling block pins it
        assert_eq!(fl.totals(), (3, half + 256 + half));
        assert!(fl.take_exact(mem + page - 256, half, &*vmm));
        fl.check().unwrap();
        vmm.check().unwrap();
    }

    #[test]
    fn reused_block_puts_the_run_back() {
        let vmm = vmm();
        let fl = Freelist::new(Config::new());
        let page = vmm.geometry().size();
        let half = page / 2;

        let mem = vmm.alloc(4 * page).as_ptr() as usize;
        let chain = straddling_chain(&fl, &vmm, mem);
        let (lo, hi) = releasable(&chain, vmm.geometry()).unwrap();
        assert_eq!((lo, hi), (mem + 2 * page, mem + 3 * page));

        // the last block is handed out after the snapshot was taken
        assert!(fl.take_exact(mem + 2 * page + half, half, &*vmm));

        assert!(!release_run(&chain, lo, hi, &fl, &vmm));
        assert_eq!(vmm.cached_pages(), 0);
        assert_eq!(fl.totals(), (4, 3 * half + 256));
        assert!(fl.take_exact(mem + 2 * page, half, &*vmm));
        fl.check().unwrap();
        vmm.check().unwrap();
    }
}
