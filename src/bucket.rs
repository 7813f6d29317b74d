//! A single freelist bucket: the addresses of free blocks of one size.
//!
//! Addresses are kept ordered so that the block nearest the growth base is
//! last, and thus popped first. Ties cannot happen as addresses are unique.
//! During free bursts new addresses are appended past the sorted prefix and
//! only sorted once a lookup needs the order.

use crate::{
    clock::NEVER,
    config::Growth,
    corevec::{CoreBuf, CoreMemory},
    error::Inconsistency,
    header::BlockHandle,
};

/// Sort key: ascending keys put the preferred block last.
#[inline]
fn key(addr: usize, growth: Growth) -> usize {
    match growth {
        Growth::Decreasing => addr,
        Growth::Increasing => !addr,
    }
}

#[derive(Debug)]
pub(crate) struct Bucket {
    buf: Option<CoreBuf<usize>>,
    count: usize,
    sorted: usize,
    last_shrink: u64,
}

impl Bucket {
    pub const fn new() -> Self {
        Self { buf: None, count: 0, sorted: 0, last_shrink: NEVER }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn sorted(&self) -> usize {
        self.sorted
    }

    pub fn cap(&self) -> usize {
        self.buf.as_ref().map_or(0, CoreBuf::cap)
    }

    #[inline]
    pub fn entries(&self) -> &[usize] {
        match &self.buf {
            // SAFETY: the first `count` entries are initialized
            Some(buf) => unsafe { buf.slice(self.count) },
            None => &[],
        }
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [usize] {
        match &mut self.buf {
            // SAFETY: as above
            Some(buf) => unsafe { buf.slice_mut(self.count) },
            None => &mut [],
        }
    }

    fn ensure_room(&mut self, core: &dyn CoreMemory) {
        let cap = self.cap();
        if self.count < cap {
            return;
        }

        self.buf = Some(match self.buf.take() {
            None => CoreBuf::alloc(core, 1),
            Some(buf) => buf.resize(core, self.count, cap * 2),
        });
    }

    /// Adds `addr`. With `keep_sorted`, it goes into the sorted prefix if the
    /// bucket is fully sorted; otherwise it is appended.
    pub fn push(&mut self, core: &dyn CoreMemory, addr: usize, growth: Growth, keep_sorted: bool) {
        self.ensure_room(core);

        let count = self.count;
        let sorted_insert = keep_sorted && self.sorted == count;

        let Some(buf) = self.buf.as_mut() else { return };
        buf.write(count, addr);
        self.count += 1;

        if sorted_insert {
            let k = key(addr, growth);
            let entries = self.entries_mut();
            let i = entries[..count].partition_point(|&a| key(a, growth) < k);
            entries.copy_within(i..count, i + 1);
            entries[i] = addr;
            self.sorted += 1;
        }
    }

    /// Sorts the appended tail into the prefix.
    pub fn sort(&mut self, growth: Growth) {
        if self.sorted < self.count {
            self.entries_mut().sort_unstable_by_key(|&a| key(a, growth));
            self.sorted = self.count;
        }
    }

    /// Removes and returns the block nearest the growth base.
    pub fn pop_preferred(&mut self, growth: Growth) -> Option<usize> {
        if self.count == 0 {
            return None;
        }

        self.sort(growth);
        self.count -= 1;
        self.sorted -= 1;

        // SAFETY: index `count` was initialized before the decrement
        self.buf.as_ref().map(|buf| unsafe { buf.as_ptr().add(self.count).read() })
    }

    /// Removes `addr` if present.
    pub fn take(&mut self, addr: usize, growth: Growth) -> bool {
        let sorted = self.sorted;
        let count = self.count;
        let k = key(addr, growth);

        let entries = self.entries_mut();
        if let Ok(i) = entries[..sorted].binary_search_by_key(&k, |&a| key(a, growth)) {
            entries.copy_within(i + 1..count, i);
            self.sorted -= 1;
            self.count -= 1;
            return true;
        }

        if let Some(i) = entries[sorted..].iter().position(|&a| a == addr) {
            entries[sorted + i] = entries[count - 1];
            self.count -= 1;
            return true;
        }

        false
    }

    /// Halves the storage while the bucket is mostly empty, at most once per `period_ms`.
    pub fn maybe_shrink(&mut self, core: &dyn CoreMemory, now: u64, period_ms: u64) {
        let cap = self.cap();
        let min_cap = core.page_size() / core::mem::size_of::<usize>();

        if cap <= min_cap || self.count >= cap / 4 {
            return;
        }
        if self.last_shrink != NEVER && now.saturating_sub(self.last_shrink) < period_ms {
            return;
        }

        self.last_shrink = now;
        if let Some(buf) = self.buf.take() {
            self.buf = Some(buf.resize(core, self.count, (cap / 2).max(min_cap)));
        }
    }

    /// Checks size tags and the order of the sorted prefix.
    pub fn check(&self, bucket: usize, size: usize, growth: Growth) -> Result<(), Inconsistency> {
        let entries = self.entries();

        for &addr in entries {
            // SAFETY: every entry is a free block owned by the freelist
            let found = unsafe { BlockHandle::read_free_tag(addr) };
            if found != size {
                return Err(Inconsistency::BucketTag { bucket, addr, found });
            }
        }

        for (i, pair) in entries[..self.sorted].windows(2).enumerate() {
            if key(pair[0], growth) >= key(pair[1], growth) {
                return Err(Inconsistency::BucketOrder { bucket, index: i + 1 });
            }
        }

        Ok(())
    }
}
