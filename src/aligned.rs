//! Allocations whose user pointer carries no block header.
//!
//! Small, highly aligned requests are served from zones: pages carved into
//! slots of the alignment, with a small header in the leading slots. Page
//! allocations aligned beyond what a header allows are recorded as is.
//! Both are listed in a table sorted by address, consulted by `free` only
//! for pointers aligned past [`ALIGN`] and only while the table is not empty.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    clock::Clock,
    corevec::CoreBuf,
    crash::fatal,
    page::PageGeometry,
    ptr_utils::WORD_SIZE,
    quantize::ALIGN,
    source::PageSource,
    stats::Usage,
    sync::Mutex,
    vmm::Vmm,
};

/// Smallest alignment the table ever serves.
pub(crate) const TABLE_MIN_ALIGN: usize = 2 * ALIGN;

const WORD_BITS: usize = usize::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// A page of `align`-sized slots.
    Zone { page: usize, align: usize },
    /// A page run handed out whole.
    Pages { ptr: usize, len: usize },
}

impl Entry {
    #[inline]
    fn key(self) -> usize {
        match self {
            Entry::Zone { page, .. } => page,
            Entry::Pages { ptr, .. } => ptr,
        }
    }
}

/// A zone page, viewed through its header words:
/// `[align, live, free bitmap...]`.
#[derive(Clone, Copy)]
struct Zone {
    page: usize,
    align: usize,
}

impl Zone {
    #[inline]
    fn words(self) -> *mut usize {
        self.page as *mut usize
    }

    fn slots(self, geo: PageGeometry) -> usize {
        geo.size() / self.align
    }

    /// Slots taken by the header.
    fn reserved(self, geo: PageGeometry) -> usize {
        let header = (2 + self.slots(geo).div_ceil(WORD_BITS)) * WORD_SIZE;
        header.div_ceil(self.align)
    }

    /// # Safety
    /// The page must be owned by the table and not yet in use.
    unsafe fn init(self, geo: PageGeometry) {
        let words = self.words();
        words.write(self.align);
        words.add(1).write(0);
        for w in 0..self.slots(geo).div_ceil(WORD_BITS) {
            words.add(2 + w).write(0);
        }

        for slot in self.reserved(geo)..self.slots(geo) {
            *words.add(2 + slot / WORD_BITS) |= 1 << (slot % WORD_BITS);
        }
    }

    unsafe fn live(self) -> usize {
        self.words().add(1).read()
    }

    /// Takes a free slot.
    unsafe fn take(self, geo: PageGeometry) -> Option<usize> {
        let words = self.words();

        for w in 0..self.slots(geo).div_ceil(WORD_BITS) {
            let bits = words.add(2 + w);
            if *bits != 0 {
                let bit = (*bits).trailing_zeros() as usize;
                *bits &= !(1 << bit);
                *words.add(1) += 1;
                return Some(self.page + (w * WORD_BITS + bit) * self.align);
            }
        }

        None
    }

    /// Returns a slot. Gives whether the zone is now empty.
    unsafe fn put(self, ptr: usize) -> bool {
        let words = self.words();
        let slot = (ptr - self.page) / self.align;
        let bits = words.add(2 + slot / WORD_BITS);
        let mask = 1 << (slot % WORD_BITS);

        if *bits & mask != 0 {
            fatal!(None, "aligned block {:#x} freed twice", ptr);
        }

        *bits |= mask;
        *words.add(1) -= 1;
        *words.add(1) == 0
    }
}

struct TableInner {
    buf: Option<CoreBuf<Entry>>,
    len: usize,
}

impl TableInner {
    fn entries(&self) -> &[Entry] {
        match &self.buf {
            // SAFETY: the first `len` entries are initialized
            Some(buf) => unsafe { buf.slice(self.len) },
            None => &[],
        }
    }

    /// Index of the entry covering `ptr`.
    fn find(&self, ptr: usize, geo: PageGeometry) -> Option<usize> {
        let entries = self.entries();
        let i = entries.partition_point(|e| e.key() <= ptr).checked_sub(1)?;

        match entries[i] {
            Entry::Zone { page, .. } if geo.page_of(ptr) == page => Some(i),
            Entry::Pages { ptr: p, .. } if p == ptr => Some(i),
            _ => None,
        }
    }

    fn insert<S: PageSource, C: Clock>(&mut self, vmm: &Vmm<S, C>, entry: Entry) {
        let cap = self.buf.as_ref().map_or(0, CoreBuf::cap);
        if self.len == cap {
            self.buf = Some(match self.buf.take() {
                None => CoreBuf::alloc(vmm, 1),
                Some(buf) => buf.resize(vmm, self.len, cap * 2),
            });
        }

        let key = entry.key();
        let i = self.entries().partition_point(|e| e.key() < key);
        let len = self.len;

        if let Some(buf) = self.buf.as_mut() {
            // SAFETY: `len < cap` after growing
            let slots = unsafe { buf.slice_mut(len + 1) };
            slots.copy_within(i..len, i + 1);
            slots[i] = entry;
            self.len += 1;
        }
    }

    fn remove(&mut self, i: usize) {
        let len = self.len;
        if let Some(buf) = self.buf.as_mut() {
            // SAFETY: as in `entries`
            unsafe { buf.slice_mut(len) }.copy_within(i + 1..len, i);
            self.len -= 1;
        }
    }
}

/// The aligned-allocation table.
pub(crate) struct AlignedTable {
    inner: Mutex<TableInner>,
    entries: AtomicUsize,
}

impl AlignedTable {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(TableInner { buf: None, len: 0 }), entries: AtomicUsize::new(0) }
    }

    /// Whether zones serve requests of `size` bytes aligned to `align`.
    pub const fn zone_fits(align: usize, size: usize, geo: PageGeometry) -> bool {
        align >= TABLE_MIN_ALIGN && align <= geo.size() / 4 && size <= align
    }

    /// Whether `free` has to look `ptr` up.
    #[inline]
    pub fn may_own(&self, ptr: NonNull<u8>) -> bool {
        ptr.as_ptr() as usize % TABLE_MIN_ALIGN == 0 && self.entries.load(Ordering::Acquire) != 0
    }

    /// Returns a slot of a zone of `align`-sized slots.
    pub fn zone_alloc<S: PageSource, C: Clock>(&self, vmm: &Vmm<S, C>, align: usize) -> NonNull<u8> {
        let geo = vmm.geometry();
        let mut inner = self.inner.lock();

        let zones = inner.entries().iter().filter_map(|e| match *e {
            Entry::Zone { page, align: a } if a == align => Some(Zone { page, align }),
            _ => None,
        });
        for zone in zones {
            // SAFETY: zone pages belong to the table, guarded by its lock
            if let Some(slot) = unsafe { zone.take(geo) } {
                // SAFETY: slots lie within the zone page
                return unsafe { NonNull::new_unchecked(slot as *mut u8) };
            }
        }

        let (page, _) = vmm.alloc_pages(geo.size(), Usage::User);
        let zone = Zone { page: page.as_ptr() as usize, align };

        // SAFETY: fresh page
        let slot = unsafe {
            zone.init(geo);
            zone.take(geo)
        };
        inner.insert(vmm, Entry::Zone { page: zone.page, align });
        self.entries.fetch_add(1, Ordering::Release);

        match slot {
            // SAFETY: as above
            Some(slot) => unsafe { NonNull::new_unchecked(slot as *mut u8) },
            None => fatal!(None, "zone of {}-byte slots has no room", align),
        }
    }

    /// Returns `len` bytes of pages aligned to `align`, trimming the
    /// over-allocation back to the page layer.
    pub fn pages_alloc<S: PageSource, C: Clock>(
        &self,
        vmm: &Vmm<S, C>,
        align: usize,
        len: usize,
    ) -> NonNull<u8> {
        let geo = vmm.geometry();
        let len = geo.round_up(len.max(1));
        let extra = align.saturating_sub(geo.size());

        let (raw, _) = vmm.alloc_pages(len + extra, Usage::User);
        let raw = raw.as_ptr() as usize;
        let ptr = (raw + align - 1) & !(align - 1);

        if ptr > raw {
            vmm.free_pages(raw, ptr - raw, Usage::User);
        }
        let tail = raw + len + extra - (ptr + len);
        if tail != 0 {
            vmm.free_pages(ptr + len, tail, Usage::User);
        }

        let mut inner = self.inner.lock();
        inner.insert(vmm, Entry::Pages { ptr, len });
        self.entries.fetch_add(1, Ordering::Release);

        // SAFETY: within a mapping
        unsafe { NonNull::new_unchecked(ptr as *mut u8) }
    }

    /// Frees `ptr` if the table owns it, returning its usable size.
    pub fn release<S: PageSource, C: Clock>(&self, vmm: &Vmm<S, C>, ptr: NonNull<u8>) -> Option<usize> {
        let geo = vmm.geometry();
        let addr = ptr.as_ptr() as usize;

        let (to_release, usable) = {
            let mut inner = self.inner.lock();
            let i = inner.find(addr, geo)?;

            match inner.entries()[i] {
                Entry::Zone { page, align } => {
                    if addr % align != 0 {
                        fatal!(None, "pointer {:#x} is not a slot of its {}-byte zone", addr, align);
                    }
                    // SAFETY: the zone is guarded by the table lock
                    let empty = unsafe { Zone { page, align }.put(addr) };
                    if empty {
                        inner.remove(i);
                        self.entries.fetch_sub(1, Ordering::Release);
                    }
                    (empty.then_some((page, geo.size())), align)
                }
                Entry::Pages { ptr, len } => {
                    inner.remove(i);
                    self.entries.fetch_sub(1, Ordering::Release);
                    (Some((ptr, len)), len)
                }
            }
        };

        if let Some((start, len)) = to_release {
            vmm.free_pages(start, len, Usage::User);
        }
        Some(usable)
    }

    /// Usable size of `ptr` if the table owns it.
    pub fn usable(&self, ptr: NonNull<u8>, geo: PageGeometry) -> Option<usize> {
        let inner = self.inner.lock();
        let i = inner.find(ptr.as_ptr() as usize, geo)?;

        Some(match inner.entries()[i] {
            Entry::Zone { align, .. } => align,
            Entry::Pages { len, .. } => len,
        })
    }

    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let Some(inner) = self.inner.try_lock() else {
            return writeln!(w, "  <locked>");
        };

        for entry in inner.entries() {
            match *entry {
                // SAFETY: zone pages stay valid while listed
                Entry::Zone { page, align } => writeln!(
                    w,
                    "  zone  {:#014x} slots of {:>5} bytes, {} live",
                    page,
                    align,
                    unsafe { Zone { page, align }.live() }
                )?,
                Entry::Pages { ptr, len } => writeln!(w, "  pages {:#014x} {:>10} bytes", ptr, len)?,
            }
        }
        Ok(())
    }
}
