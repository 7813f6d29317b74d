//! Helpers shared by the unit tests.

use core::{
    cell::{Cell, RefCell},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    boxed::Box,
    vec::Vec,
};

use crate::{
    clock::ManualClock,
    config::Config,
    corevec::CoreMemory,
    freelist::Backend,
    page::PageGeometry,
    source::{MapLoadError, PageSource, Protection, UnixMMapSource},
    XMalloc,
};

/// Page-aligned core memory from the test harness's allocator.
pub(crate) struct HeapCore {
    page: usize,
    live: AtomicUsize,
}

impl HeapCore {
    pub fn new(page: usize) -> Self {
        Self { page, live: AtomicUsize::new(0) }
    }

    /// Bytes handed out and not yet returned.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl CoreMemory for HeapCore {
    fn page_size(&self) -> usize {
        self.page
    }

    fn alloc_core(&self, len: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(len, self.page).unwrap();
        self.live.fetch_add(len, Ordering::Relaxed);
        NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap()
    }

    unsafe fn free_core(&self, ptr: NonNull<u8>, len: usize) {
        self.live.fetch_sub(len, Ordering::Relaxed);
        dealloc(ptr.as_ptr(), Layout::from_size_align(len, self.page).unwrap());
    }
}

const TEST_PAGE: usize = 4096;

/// A freelist backend over harness-allocated regions that counts released pages.
pub(crate) struct TestBackend {
    core: HeapCore,
    regions: RefCell<Vec<(NonNull<u8>, Layout)>>,
    released: Cell<usize>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self { core: HeapCore::new(TEST_PAGE), regions: RefCell::new(Vec::new()), released: Cell::new(0) }
    }

    /// A fresh page-aligned region of `len` bytes, returned on drop.
    pub fn region(&self, len: usize) -> usize {
        let layout = Layout::from_size_align(len, TEST_PAGE).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        self.regions.borrow_mut().push((ptr, layout));
        ptr.as_ptr() as usize
    }

    /// Pages passed to [`Backend::release_pages`] so far.
    pub fn released(&self) -> usize {
        self.released.get()
    }
}

impl Backend for TestBackend {
    fn core(&self) -> &dyn CoreMemory {
        &self.core
    }

    fn geometry(&self) -> PageGeometry {
        PageGeometry::new(TEST_PAGE)
    }

    fn now(&self) -> u64 {
        0
    }

    fn release_pages(&self, addr: usize, len: usize) {
        assert!(addr % TEST_PAGE == 0 && len % TEST_PAGE == 0);
        self.released.set(self.released.get() + len / TEST_PAGE);
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        for (ptr, layout) in self.regions.borrow_mut().drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

const FAKE_HEAP_SIZE: usize = 64 << 20;

/// The system page source, except that heap extension works on a private
/// mapping so that tests neither share nor disturb the real program break.
pub(crate) struct TestSource {
    os: UnixMMapSource,
    heap: usize,
    brk: AtomicUsize,
}

impl TestSource {
    pub fn new() -> Self {
        let os = UnixMMapSource::new();
        let heap = os.map(None, FAKE_HEAP_SIZE).unwrap().as_ptr() as usize;
        Self { os, heap, brk: AtomicUsize::new(heap) }
    }

    /// Bytes the fake heap has grown by.
    pub fn heap_used(&self) -> usize {
        self.brk.load(Ordering::Relaxed) - self.heap
    }
}

unsafe impl PageSource for TestSource {
    fn page_size(&self) -> usize {
        self.os.page_size()
    }

    fn map(&self, hint: Option<NonNull<u8>>, len: usize) -> Option<NonNull<u8>> {
        self.os.map(hint, len)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        self.os.unmap(base, len)
    }

    unsafe fn protect(&self, base: NonNull<u8>, len: usize, prot: Protection) -> bool {
        self.os.protect(base, len, prot)
    }

    unsafe fn invalidate(&self, base: NonNull<u8>, len: usize) -> bool {
        self.os.invalidate(base, len)
    }

    fn grow_heap(&self, increment: isize) -> Option<NonNull<u8>> {
        let old = self.brk.load(Ordering::Relaxed);
        let new = old.checked_add_signed(increment)?;
        if new < self.heap || new > self.heap + FAKE_HEAP_SIZE {
            return None;
        }
        self.brk.store(new, Ordering::Relaxed);
        NonNull::new(old as *mut u8)
    }

    fn heap_break(&self) -> *mut u8 {
        self.brk.load(Ordering::Relaxed) as *mut u8
    }

    fn load_map(&self, sink: &mut dyn FnMut(usize, usize)) -> Result<(), MapLoadError> {
        self.os.load_map(sink)
    }
}

impl Drop for TestSource {
    fn drop(&mut self) {
        unsafe { self.os.unmap(NonNull::new_unchecked(self.heap as *mut u8), FAKE_HEAP_SIZE) };
    }
}

pub(crate) type TestXMalloc = XMalloc<TestSource, ManualClock>;

/// An initialized allocator on a [`TestSource`] and a clock stopped at zero.
pub(crate) fn xmalloc(config: Config) -> Box<TestXMalloc> {
    let xm = Box::new(XMalloc::new(TestSource::new(), ManualClock::new(0), config));
    xm.init();
    xm
}

/// Fills `len` bytes at `ptr` with a pattern derived from `seed`.
pub(crate) fn scribble(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
}

/// Checks a pattern written by [`scribble`].
pub(crate) fn verify(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
}
