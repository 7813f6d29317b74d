//! Metadata storage taken directly from the page layer.
//!
//! Region maps, bucket arrays and collector scratch space cannot come from
//! the heap they describe, so they are carved from whole pages.

use core::{marker::PhantomData, ptr::NonNull};

/// Page-granular memory for allocator metadata.
pub(crate) trait CoreMemory {
    fn page_size(&self) -> usize;

    /// Returns at least `len` bytes of zeroed, page-aligned memory. Never fails.
    fn alloc_core(&self, len: usize) -> NonNull<u8>;

    /// # Safety
    /// `ptr` and `len` must come from a previous [`CoreMemory::alloc_core`] call.
    unsafe fn free_core(&self, ptr: NonNull<u8>, len: usize);
}

/// A fixed-capacity array of `T` living in core pages.
///
/// Does not track its length nor free itself on drop: the owner does both.
#[derive(Debug)]
pub(crate) struct CoreBuf<T: Copy> {
    ptr: NonNull<T>,
    cap: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for CoreBuf<T> {}

impl<T: Copy> CoreBuf<T> {
    /// Allocates room for at least `min_cap` elements, rounded up to whole pages.
    pub fn alloc(core: &dyn CoreMemory, min_cap: usize) -> Self {
        let page = core.page_size();
        let bytes = (min_cap.max(1) * core::mem::size_of::<T>() + page - 1) & !(page - 1);
        let ptr = core.alloc_core(bytes);

        Self { ptr: ptr.cast(), cap: bytes / core::mem::size_of::<T>(), _marker: PhantomData }
    }

    /// Returns the storage to the page layer.
    ///
    /// # Safety
    /// No references into the buffer may outlive this call.
    pub unsafe fn free(self, core: &dyn CoreMemory) {
        core.free_core(self.ptr.cast(), self.bytes());
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.cap * core::mem::size_of::<T>()
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The first `len` elements must have been initialized and `len <= cap`.
    #[inline]
    pub unsafe fn slice(&self, len: usize) -> &[T] {
        debug_assert!(len <= self.cap);
        core::slice::from_raw_parts(self.ptr.as_ptr(), len)
    }

    /// # Safety
    /// The first `len` elements must have been initialized and `len <= cap`.
    #[inline]
    pub unsafe fn slice_mut(&mut self, len: usize) -> &mut [T] {
        debug_assert!(len <= self.cap);
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), len)
    }

    /// Writes `value` at `index`.
    ///
    /// # Panics
    /// Panics if `index >= cap`.
    #[inline]
    pub fn write(&mut self, index: usize, value: T) {
        assert!(index < self.cap);
        unsafe { self.ptr.as_ptr().add(index).write(value) }
    }

    /// Moves the first `len` elements into a buffer of at least `new_cap`
    /// elements and frees this one.
    pub fn resize(self, core: &dyn CoreMemory, len: usize, new_cap: usize) -> Self {
        debug_assert!(len <= new_cap);
        let new = Self::alloc(core, new_cap);

        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new.ptr.as_ptr(), len);
            self.free(core);
        }

        new
    }
}
