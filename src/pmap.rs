//! The region map: a sorted array of address-range fragments.
//!
//! Each map describes part of the process's virtual address space as
//! non-overlapping fragments tagged [`RegionKind::Native`] (mapped by the
//! allocator), [`RegionKind::Mapped`] (mapped by the client, explicitly
//! announced) or [`RegionKind::Foreign`] (owned by something else).
//! Touching fragments of the same kind are always coalesced.
//!
//! The array lives inline until it fills up, after which it is moved into
//! core pages obtained from the very page layer it describes. Growing it thus
//! re-enters the map: the thread doing so is recorded, and a recursive call
//! proceeds in the headroom kept for that purpose instead of growing again.

use core::fmt;

use crate::{
    config::Growth,
    corevec::{CoreBuf, CoreMemory},
    crash::fatal,
    error::Inconsistency,
    source::MapLoadError,
    sync::{Claim, Mutex, OwnerFlag},
};

const INLINE_FRAGMENTS: usize = 64;
/// Free slots kept for operations issued while the array is being grown.
const SLACK: usize = 16;
/// Room one operation may need: carving can split a fragment, then the new one goes in.
const OP_ROOM: usize = 2;

/// Lowest address ever proposed as a mapping hint.
const MIN_HINT: usize = 0x10000;
#[cfg(target_pointer_width = "64")]
const MAX_HINT: usize = 1 << 47;
#[cfg(not(target_pointer_width = "64"))]
const MAX_HINT: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Native,
    Mapped,
    Foreign,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionKind::Native => "native",
            RegionKind::Mapped => "mapped",
            RegionKind::Foreign => "foreign",
        })
    }
}

/// A contiguous address range of a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub start: usize,
    pub end: usize,
    pub kind: RegionKind,
    /// Clock time of the last change to this fragment.
    pub last_touched: u64,
}

impl Fragment {
    const EMPTY: Fragment = Fragment { start: 0, end: 0, kind: RegionKind::Foreign, last_touched: 0 };

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

struct MapInner {
    inline: [Fragment; INLINE_FRAGMENTS],
    heap: Option<CoreBuf<Fragment>>,
    len: usize,
    generation: u64,
    loaded: bool,
}

impl MapInner {
    const fn new() -> Self {
        Self {
            inline: [Fragment::EMPTY; INLINE_FRAGMENTS],
            heap: None,
            len: 0,
            generation: 0,
            loaded: false,
        }
    }

    #[inline]
    fn cap(&self) -> usize {
        self.heap.as_ref().map_or(INLINE_FRAGMENTS, CoreBuf::cap)
    }

    #[inline]
    fn frags(&self) -> &[Fragment] {
        match &self.heap {
            // SAFETY: the first `len` fragments are always initialized
            Some(buf) => unsafe { buf.slice(self.len) },
            None => &self.inline[..self.len],
        }
    }

    /// The whole backing array, initialized or not.
    #[inline]
    fn storage_mut(&mut self) -> &mut [Fragment] {
        match &mut self.heap {
            Some(buf) => {
                let cap = buf.cap();
                // SAFETY: fragments are plain data, stale slots are never read before being written
                unsafe { buf.slice_mut(cap) }
            }
            None => &mut self.inline[..],
        }
    }

    fn insert_at(&mut self, index: usize, frag: Fragment) {
        let len = self.len;
        if len == self.cap() {
            fatal!(None, "region map full ({} fragments) while it was being extended", len);
        }

        let storage = self.storage_mut();
        storage.copy_within(index..len, index + 1);
        storage[index] = frag;
        self.len += 1;
    }

    fn remove_at(&mut self, index: usize) {
        let len = self.len;
        self.storage_mut().copy_within(index + 1..len, index);
        self.len -= 1;
    }

    /// Index of the first fragment ending after `addr`.
    #[inline]
    fn first_ending_after(&self, addr: usize) -> usize {
        self.frags().partition_point(|f| f.end <= addr)
    }

    fn find(&self, addr: usize) -> Option<usize> {
        let i = self.first_ending_after(addr);
        (i < self.len && self.frags()[i].start <= addr).then_some(i)
    }

    /// Removes `start..end` from every fragment overlapping it.
    fn carve(&mut self, start: usize, end: usize) {
        let mut i = self.first_ending_after(start);

        while i < self.len {
            let frag = self.frags()[i];
            if frag.start >= end {
                break;
            }

            if frag.start < start && frag.end > end {
                self.storage_mut()[i].end = start;
                self.insert_at(i + 1, Fragment { start: end, ..frag });
                break;
            } else if frag.start < start {
                self.storage_mut()[i].end = start;
                i += 1;
            } else if frag.end > end {
                self.storage_mut()[i].start = end;
                break;
            } else {
                self.remove_at(i);
            }
        }
    }

    /// Makes `start..end` a fragment of `kind`, replacing whatever overlapped it.
    fn place(&mut self, start: usize, end: usize, kind: RegionKind, now: u64) {
        self.carve(start, end);

        let i = self.frags().partition_point(|f| f.start < start);
        let frags = self.frags();
        let merge_prev = i > 0 && frags[i - 1].end == start && frags[i - 1].kind == kind;
        let merge_next = i < frags.len() && frags[i].start == end && frags[i].kind == kind;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next_end = frags[i].end;
                let storage = self.storage_mut();
                storage[i - 1].end = next_end;
                storage[i - 1].last_touched = now;
                self.remove_at(i);
            }
            (true, false) => {
                let prev = &mut self.storage_mut()[i - 1];
                prev.end = end;
                prev.last_touched = now;
            }
            (false, true) => {
                let next = &mut self.storage_mut()[i];
                next.start = start;
                next.last_touched = now;
            }
            (false, false) => {
                self.insert_at(i, Fragment { start, end, kind, last_touched: now });
            }
        }
    }

    /// Appends a range reported by the OS map, which arrives sorted.
    fn push_loaded(&mut self, start: usize, end: usize, now: u64) -> bool {
        if let Some(last) = self.len.checked_sub(1) {
            let prev = &mut self.storage_mut()[last];
            if start <= prev.end {
                prev.end = prev.end.max(end);
                return true;
            }
        }

        if self.len == self.cap() {
            return false;
        }

        let len = self.len;
        self.storage_mut()[len] =
            Fragment { start, end, kind: RegionKind::Foreign, last_touched: now };
        self.len += 1;
        true
    }
}

/// A mutex-protected, self-extending region map.
pub struct RegionMap {
    inner: Mutex<MapInner>,
    extending: OwnerFlag,
}

impl RegionMap {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(MapInner::new()), extending: OwnerFlag::new() }
    }

    /// Ensures at least `min_free` free slots, growing the array through `core`.
    ///
    /// A call made while the same thread is already growing this map returns
    /// immediately and relies on the headroom.
    fn reserve(&self, core: &dyn CoreMemory, min_free: usize) {
        loop {
            let (len, cap) = {
                let inner = self.inner.lock();
                (inner.len, inner.cap())
            };

            if cap - len >= min_free {
                return;
            }

            match self.extending.claim() {
                Claim::Acquired => {}
                Claim::Recursive => return,
                Claim::Busy => {
                    core::hint::spin_loop();
                    continue;
                }
            }

            let target = (cap * 2).max(len + min_free + SLACK);

            // re-enters this map when the page layer records the new pages
            let fresh = CoreBuf::<Fragment>::alloc(core, target);

            let discard = {
                let mut inner = self.inner.lock();

                if inner.cap() >= target {
                    Some(fresh)
                } else {
                    let mut fresh = fresh;
                    for (i, frag) in inner.frags().iter().enumerate() {
                        fresh.write(i, *frag);
                    }
                    inner.heap.replace(fresh)
                }
            };

            self.extending.release();

            if let Some(buf) = discard {
                // SAFETY: no longer referenced by the map
                unsafe { buf.free(core) };
            }
        }
    }

    #[inline]
    fn reserve_op(&self, core: &dyn CoreMemory) {
        self.reserve(core, SLACK + OP_ROOM);
    }

    /// Returns the fragment containing `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<Fragment> {
        let inner = self.inner.lock();
        inner.find(addr).map(|i| inner.frags()[i])
    }

    /// Records `start..start + len` as `kind`, coalescing with touching fragments of the same kind.
    ///
    /// Foreign fragments in the way are shrunk, split or deleted.
    pub(crate) fn insert(
        &self,
        core: &dyn CoreMemory,
        start: usize,
        len: usize,
        kind: RegionKind,
        now: u64,
    ) {
        self.reserve_op(core);

        let mut inner = self.inner.lock();

        debug_assert!(
            {
                let first = inner.first_ending_after(start);
                inner.frags()[first..]
                    .iter()
                    .take_while(|f| f.start < start + len)
                    .all(|f| f.kind == RegionKind::Foreign || f.kind == kind)
            },
            "inserting over an owned region"
        );

        inner.place(start, start + len, kind, now);
    }

    /// Records `start..start + len` as `kind`, whatever the map believed before.
    pub(crate) fn overrule(
        &self,
        core: &dyn CoreMemory,
        start: usize,
        len: usize,
        kind: RegionKind,
        now: u64,
    ) {
        self.reserve_op(core);
        self.inner.lock().place(start, start + len, kind, now);
    }

    /// Forgets `start..start + len`.
    pub(crate) fn remove(&self, core: &dyn CoreMemory, start: usize, len: usize) {
        self.reserve_op(core);
        self.inner.lock().carve(start, start + len);
    }

    /// Records every unrecorded part of `start..start + len` as `kind`,
    /// leaving existing fragments untouched.
    pub(crate) fn fill_gaps(
        &self,
        core: &dyn CoreMemory,
        start: usize,
        len: usize,
        kind: RegionKind,
        now: u64,
    ) {
        let end = start + len;
        let mut cursor = start;

        while cursor < end {
            self.reserve_op(core);
            let mut inner = self.inner.lock();

            let i = inner.first_ending_after(cursor);
            let frags = inner.frags();

            if i < frags.len() && frags[i].start <= cursor {
                cursor = frags[i].end;
                continue;
            }

            let gap_end = frags.get(i).map_or(end, |f| f.start.min(end));
            inner.place(cursor, gap_end, kind, now);
            cursor = gap_end;
        }
    }

    /// The first native fragment ending past `addr`.
    pub(crate) fn next_native(&self, addr: usize) -> Option<Fragment> {
        let inner = self.inner.lock();
        let i = inner.first_ending_after(addr);
        inner.frags()[i..].iter().find(|f| f.kind == RegionKind::Native).copied()
    }

    /// Finds an unrecorded gap of at least `len` bytes, walking away from
    /// `base` in the direction of `growth`.
    ///
    /// Falls back to the unbounded space past the outermost fragment.
    pub fn find_hole(&self, len: usize, base: usize, growth: Growth) -> Option<usize> {
        let inner = self.inner.lock();
        let frags = inner.frags();

        if frags.is_empty() || len == 0 {
            return None;
        }

        match growth {
            Growth::Decreasing => {
                let mut upper = inner.find(base).map_or(base, |i| frags[i].start);
                let below = frags.partition_point(|f| f.end <= upper);

                for frag in frags[..below].iter().rev() {
                    if upper - frag.end >= len {
                        return Some(upper - len);
                    }
                    upper = frag.start;
                }

                (upper >= MIN_HINT + len).then(|| upper - len)
            }
            Growth::Increasing => {
                let mut lower = inner.find(base).map_or(base, |i| frags[i].end);
                let above = frags.partition_point(|f| f.start < lower);

                for frag in &frags[above..] {
                    if frag.start - lower >= len {
                        return Some(lower);
                    }
                    lower = frag.end;
                }

                lower.checked_add(len).filter(|&end| end <= MAX_HINT).map(|_| lower)
            }
        }
    }

    /// Whether `start..start + len` is exactly one native fragment wedged
    /// between two foreign ones, so that it can never coalesce with anything.
    pub fn is_isolated(&self, start: usize, len: usize) -> bool {
        let inner = self.inner.lock();
        let frags = inner.frags();

        let Some(i) = inner.find(start) else {
            return false;
        };
        let frag = frags[i];

        frag.kind == RegionKind::Native
            && frag.start == start
            && frag.end == start + len
            && i > 0
            && frags[i - 1].kind == RegionKind::Foreign
            && frags[i - 1].end == start
            && i + 1 < frags.len()
            && frags[i + 1].kind == RegionKind::Foreign
            && frags[i + 1].start == frag.end
    }

    /// Replaces the contents with the OS-reported process map, recording
    /// every range as foreign, and bumps the generation.
    ///
    /// `load` must report ranges in ascending order.
    pub(crate) fn reload(
        &self,
        core: &dyn CoreMemory,
        load: &dyn Fn(&mut dyn FnMut(usize, usize)) -> Result<(), MapLoadError>,
        now: u64,
    ) -> Result<u64, MapLoadError> {
        // the process map may grow between counting and loading
        for _ in 0..3 {
            let mut count = 0;
            load(&mut |_, _| count += 1)?;

            self.reserve(core, count + SLACK);

            let mut inner = self.inner.lock();
            let mut overflowed = false;
            inner.len = 0;

            let result = load(&mut |start, end| {
                if !overflowed && !inner.push_loaded(start, end, now) {
                    overflowed = true;
                }
            });

            if let Err(e) = result {
                inner.len = 0;
                inner.loaded = false;
                return Err(e);
            }

            if !overflowed {
                inner.generation += 1;
                inner.loaded = true;
                return Ok(inner.generation);
            }
        }

        let mut inner = self.inner.lock();
        inner.len = 0;
        inner.loaded = false;
        Err(MapLoadError::Unreadable)
    }

    /// Whether the map currently holds a successfully loaded OS view.
    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Number of fragments.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands every native fragment to `release` and empties the map.
    ///
    /// The fragment holding the map's own storage is released last.
    pub(crate) fn drain_native(&mut self, mut release: impl FnMut(usize, usize)) {
        let inner = self.inner.get_mut();
        let storage = inner.heap.as_ref().map(|buf| buf.as_ptr() as usize);
        let mut holding_storage = None;

        for frag in inner.frags().iter().filter(|f| f.kind == RegionKind::Native) {
            if storage.map_or(false, |s| frag.contains(s)) {
                holding_storage = Some((frag.start, frag.len()));
            } else {
                release(frag.start, frag.len());
            }
        }

        inner.heap = None;
        inner.len = 0;

        if let Some((start, len)) = holding_storage {
            release(start, len);
        }
    }

    /// Total bytes covered by fragments of `kind`.
    pub fn bytes_of(&self, kind: RegionKind) -> usize {
        self.inner.lock().frags().iter().filter(|f| f.kind == kind).map(Fragment::len).sum()
    }

    /// Calls `f` on every fragment in ascending order. `f` must not touch this map.
    pub fn for_each(&self, mut f: impl FnMut(&Fragment)) {
        self.inner.lock().frags().iter().for_each(|frag| f(frag));
    }

    /// Verifies ordering, non-overlap and coalescing.
    pub fn check(&self) -> Result<(), Inconsistency> {
        let inner = self.inner.lock();
        let frags = inner.frags();

        for (index, frag) in frags.iter().enumerate() {
            if frag.start >= frag.end {
                return Err(Inconsistency::RegionEmpty { index, start: frag.start, end: frag.end });
            }

            if let Some(prev) = index.checked_sub(1).map(|p| frags[p]) {
                if frag.start < prev.end {
                    return Err(Inconsistency::RegionOverlap {
                        index,
                        start: frag.start,
                        prev_end: prev.end,
                    });
                }
                if frag.start == prev.end && frag.kind == prev.kind {
                    return Err(Inconsistency::RegionNotCoalesced { index, addr: frag.start });
                }
            }
        }

        Ok(())
    }

    /// Writes one line per fragment. Never blocks: a locked map is reported as such.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let Some(inner) = self.inner.try_lock() else {
            return writeln!(w, "  <region map locked>");
        };

        writeln!(w, "  {} fragments, generation {}", inner.len, inner.generation)?;
        for frag in inner.frags() {
            writeln!(
                w,
                "  {:#016x}-{:#016x} {:>8} {:>12} touched@{}",
                frag.start,
                frag.end,
                frag.kind,
                frag.len(),
                frag.last_touched
            )?;
        }

        Ok(())
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionMap").field("len", &self.len()).finish()
    }
}
