//! The page cache: recently freed page runs kept mapped for reuse.
//!
//! There is one line per run length, from one to [`CACHE_LINES`] pages. Each
//! line holds up to [`LINE_ENTRIES`] runs sorted by address. Only one line
//! lock is ever held at a time.

use core::fmt;

use crossbeam_utils::CachePadded;

use crate::{
    config::Growth,
    error::Inconsistency,
    page::PageGeometry,
    sync::Mutex,
};

/// Longest cached run, in pages.
pub const CACHE_LINES: usize = 32;
/// Capacity of one cache line.
pub const LINE_ENTRIES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    base: usize,
    time: u64,
}

impl Entry {
    const EMPTY: Entry = Entry { base: 0, time: 0 };
}

struct Line {
    entries: [Entry; LINE_ENTRIES],
    len: usize,
}

impl Line {
    const fn new() -> Self {
        Self { entries: [Entry::EMPTY; LINE_ENTRIES], len: 0 }
    }

    #[inline]
    fn live(&self) -> &[Entry] {
        &self.entries[..self.len]
    }

    fn take(&mut self, base: usize) -> Option<Entry> {
        let i = self.live().binary_search_by_key(&base, |e| e.base).ok()?;
        Some(self.remove_at(i))
    }

    fn remove_at(&mut self, i: usize) -> Entry {
        let entry = self.entries[i];
        self.entries.copy_within(i + 1..self.len, i);
        self.len -= 1;
        entry
    }

    /// Files `entry`, evicting the oldest one if the line is full.
    fn push(&mut self, entry: Entry) -> Option<Entry> {
        let evicted = if self.len == LINE_ENTRIES {
            let oldest = self
                .live()
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.time)
                .map_or(0, |(i, _)| i);
            Some(self.remove_at(oldest))
        } else {
            None
        };

        let i = self.live().partition_point(|e| e.base < entry.base);
        self.entries.copy_within(i..self.len, i + 1);
        self.entries[i] = entry;
        self.len += 1;

        evicted
    }

    fn pop_preferred(&mut self, growth: Growth) -> Option<Entry> {
        if self.len == 0 {
            return None;
        }

        Some(match growth {
            Growth::Decreasing => self.remove_at(self.len - 1),
            Growth::Increasing => self.remove_at(0),
        })
    }
}

/// Page runs pushed out of the cache, which the caller must unmap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evicted {
    runs: [(usize, usize); 2],
    len: usize,
}

impl Evicted {
    fn push(&mut self, base: usize, pages: usize) {
        self.runs[self.len] = (base, pages);
        self.len += 1;
    }

    fn push_entry(&mut self, entry: Option<Entry>, pages: usize) {
        if let Some(e) = entry {
            self.push(e.base, pages);
        }
    }

    /// `(base, pages)` of every evicted run.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.runs[..self.len].iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub(crate) struct PageCache {
    lines: [CachePadded<Mutex<Line>>; CACHE_LINES],
}

impl PageCache {
    pub const fn new() -> Self {
        const LINE: CachePadded<Mutex<Line>> = CachePadded::new(Mutex::new(Line::new()));
        Self { lines: [LINE; CACHE_LINES] }
    }

    #[inline]
    fn line(&self, pages: usize) -> &Mutex<Line> {
        &self.lines[pages - 1]
    }

    /// Takes a cached run of exactly `pages` pages out of the cache.
    ///
    /// Up to [`CACHE_LINES`] pages, the matching line is tried first, then
    /// longer runs are split. Beyond that, contiguous full-length runs are
    /// merged. Leftovers go back into the cache.
    pub fn find(
        &self,
        pages: usize,
        geo: PageGeometry,
        growth: Growth,
        now: u64,
    ) -> (Option<usize>, Evicted) {
        let mut evicted = Evicted::default();

        if pages == 0 {
            return (None, evicted);
        }

        if pages > CACHE_LINES {
            return self.find_merged(pages, geo, now);
        }

        if let Some(entry) = self.line(pages).lock().pop_preferred(growth) {
            return (Some(entry.base), evicted);
        }

        for longer in pages + 1..=CACHE_LINES {
            let Some(entry) = self.line(longer).lock().pop_preferred(growth) else {
                continue;
            };

            let rest = longer - pages;
            let (taken, rest_base) = match growth {
                Growth::Increasing => (entry.base, entry.base + geo.bytes(pages)),
                Growth::Decreasing => (entry.base + geo.bytes(rest), entry.base),
            };

            let victim = self.line(rest).lock().push(Entry { base: rest_base, time: entry.time });
            evicted.push_entry(victim, rest);

            return (Some(taken), evicted);
        }

        (None, evicted)
    }

    fn find_merged(&self, pages: usize, geo: PageGeometry, now: u64) -> (Option<usize>, Evicted) {
        let mut evicted = Evicted::default();
        let needed = pages.div_ceil(CACHE_LINES);
        let stride = geo.bytes(CACHE_LINES);

        let base = {
            let mut line = self.line(CACHE_LINES).lock();
            let entries = line.live();

            let mut run_start = 0;
            let mut found = None;
            for i in 0..entries.len() {
                if i > 0 && entries[i - 1].base + stride != entries[i].base {
                    run_start = i;
                }
                if i + 1 - run_start == needed {
                    found = Some(run_start);
                    break;
                }
            }

            let Some(first) = found else {
                return (None, evicted);
            };

            let base = entries[first].base;
            for _ in 0..needed {
                line.remove_at(first);
            }
            base
        };

        let leftover = needed * CACHE_LINES - pages;
        if leftover != 0 {
            let victim = self
                .line(leftover)
                .lock()
                .push(Entry { base: base + geo.bytes(pages), time: now });
            evicted.push_entry(victim, leftover);
        }

        (Some(base), evicted)
    }

    /// Takes `pages` pages starting exactly at `base`, out of a cached run
    /// starting there. The rest of that run stays cached.
    pub fn take_at(&self, base: usize, pages: usize, geo: PageGeometry) -> (bool, Evicted) {
        let mut evicted = Evicted::default();

        if pages == 0 || pages > CACHE_LINES {
            return (false, evicted);
        }

        for longer in pages..=CACHE_LINES {
            let Some(entry) = self.line(longer).lock().take(base) else {
                continue;
            };

            let rest = longer - pages;
            if rest != 0 {
                let victim = self
                    .line(rest)
                    .lock()
                    .push(Entry { base: base + geo.bytes(pages), time: entry.time });
                evicted.push_entry(victim, rest);
            }

            return (true, evicted);
        }

        (false, evicted)
    }

    /// Caches `pages` pages at `base`, first merging with touching cached runs
    /// as long as the result still fits a line.
    pub fn insert(&self, base: usize, pages: usize, geo: PageGeometry, now: u64) -> Evicted {
        debug_assert!(pages >= 1 && pages <= CACHE_LINES);

        let mut evicted = Evicted::default();
        let (mut base, mut pages) = (base, pages);

        'merge: loop {
            for k in 1..=CACHE_LINES - pages {
                if let Some(prev) = base.checked_sub(geo.bytes(k)) {
                    if self.line(k).lock().take(prev).is_some() {
                        base = prev;
                        pages += k;
                        continue 'merge;
                    }
                }

                if self.line(k).lock().take(base + geo.bytes(pages)).is_some() {
                    pages += k;
                    continue 'merge;
                }
            }

            break;
        }

        let victim = self.line(pages).lock().push(Entry { base, time: now });
        evicted.push_entry(victim, pages);
        evicted
    }

    /// Removes every run for which `expired(base, pages, age)` holds,
    /// passing each to `release` once its line is unlocked.
    pub fn reclaim(
        &self,
        now: u64,
        mut expired: impl FnMut(usize, usize, u64) -> bool,
        mut release: impl FnMut(usize, usize),
    ) {
        let mut batch = [Entry::EMPTY; LINE_ENTRIES];

        for pages in 1..=CACHE_LINES {
            let mut count = 0;
            {
                let mut line = self.line(pages).lock();
                let mut i = 0;
                while i < line.len {
                    let entry = line.entries[i];
                    if expired(entry.base, pages, now.saturating_sub(entry.time)) {
                        batch[count] = line.remove_at(i);
                        count += 1;
                    } else {
                        i += 1;
                    }
                }
            }

            for entry in &batch[..count] {
                release(entry.base, pages);
            }
        }
    }

    /// Total pages held.
    pub fn pages(&self) -> usize {
        (1..=CACHE_LINES).map(|p| self.line(p).lock().len * p).sum()
    }

    pub fn check(&self) -> Result<(), Inconsistency> {
        for pages in 1..=CACHE_LINES {
            let line = self.line(pages).lock();
            for (index, pair) in line.live().windows(2).enumerate() {
                if pair[0].base >= pair[1].base {
                    return Err(Inconsistency::CacheOrder { line: pages, index: index + 1 });
                }
            }
        }

        Ok(())
    }

    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        for pages in 1..=CACHE_LINES {
            match self.line(pages).try_lock() {
                Some(line) if line.len != 0 => {
                    writeln!(w, "  line {:>2}: {:>3} runs", pages, line.len)?;
                }
                Some(_) => {}
                None => writeln!(w, "  line {:>2}: <locked>", pages)?,
            }
        }
        Ok(())
    }
}
