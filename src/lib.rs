#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod aligned;
mod bitfield;
mod boot;
mod bucket;
mod cache;
mod clock;
mod config;
mod corevec;
mod crash;
mod error;
mod freelist;
mod global;
mod header;
mod page;
mod pmap;
mod ptr_utils;
mod quantize;
pub mod source;
mod stats;
mod sync;
mod vmm;
mod xgc;
mod xmalloc;

#[cfg(test)]
mod test_utils;

#[cfg(all(feature = "system-backed", unix))]
pub use clock::MonotonicClock;
pub use clock::{Clock, ManualClock};
pub use config::{Config, Growth};
pub use crash::{set_crash_hook, Diagnostics};
pub use error::Inconsistency;
pub use page::PageGeometry;
pub use pmap::{Fragment, RegionKind, RegionMap};
pub use quantize::{ALIGN, BUCKETS, MAXSIZE};
pub use source::{MapLoadError, PageSource, Protection};
pub use stats::Counters;
pub use vmm::Vmm;
pub use xgc::XgcReport;
pub use xmalloc::XMalloc;

/// An allocator on `mmap(2)` and the monotonic clock, ready to be a
/// `#[global_allocator]`.
#[cfg(all(feature = "system-backed", unix))]
pub type SystemXMalloc = XMalloc<source::UnixMMapSource, MonotonicClock>;

#[cfg(all(feature = "system-backed", unix))]
impl SystemXMalloc {
    /// An allocator with the default [`Config`].
    pub const fn system() -> Self {
        Self::new(source::UnixMMapSource::new(), MonotonicClock::new(), Config::new())
    }
}
