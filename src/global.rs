//! [`GlobalAlloc`] and [`Allocator`] for [`XMalloc`].

use core::ptr::{null_mut, NonNull};

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use crate::{clock::Clock, ptr_utils::is_aligned_to, quantize::ALIGN, source::PageSource, XMalloc};

impl<S: PageSource, C: Clock> XMalloc<S, C> {
    fn allocate_layout(&self, layout: Layout) -> NonNull<u8> {
        if layout.align() <= ALIGN {
            self.allocate(layout.size())
        } else {
            self.allocate_aligned(layout.align(), layout.size())
        }
    }

    /// # Safety
    /// `ptr` must be live, allocated with `old_layout`, and `new_size` nonzero.
    unsafe fn reallocate_layout(&self, ptr: NonNull<u8>, old_layout: Layout, new_size: usize) -> NonNull<u8> {
        if old_layout.align() <= ALIGN {
            if let Some(new) = self.reallocate(Some(ptr), new_size) {
                return new;
            }
        }

        if new_size <= self.usable_size(ptr) {
            return ptr;
        }

        let new = self.allocate_aligned(old_layout.align(), new_size);
        new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old_layout.size().min(new_size));
        self.free(ptr);
        new
    }
}

unsafe impl<S: PageSource, C: Clock> GlobalAlloc for XMalloc<S, C> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout(layout).as_ptr()
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGN {
            return self.allocate_zeroed(layout.size()).as_ptr();
        }

        let ptr = self.allocate_aligned(layout.align(), layout.size());
        ptr.as_ptr().write_bytes(0, layout.size());
        ptr.as_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        match NonNull::new(ptr) {
            Some(ptr) => self.reallocate_layout(ptr, old_layout, new_size).as_ptr(),
            None => null_mut(),
        }
    }
}

unsafe impl<S: PageSource, C: Clock> Allocator for XMalloc<S, C> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice_from_raw_parts(dangling(layout), 0));
        }

        Ok(nonnull_slice_from_raw_parts(self.allocate_layout(layout), layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.free(ptr);
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        if !is_aligned_to(ptr.as_ptr() as usize, new_layout.align()) {
            let new = self.allocate_layout(new_layout);
            new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old_layout.size());
            self.free(ptr);
            return Ok(nonnull_slice_from_raw_parts(new, new_layout.size()));
        }

        let new = self.reallocate_layout(ptr, old_layout, new_layout.size());
        Ok(nonnull_slice_from_raw_parts(new, new_layout.size()))
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() != 0 {
                self.free(ptr);
            }
            return Ok(nonnull_slice_from_raw_parts(dangling(new_layout), 0));
        }

        if !is_aligned_to(ptr.as_ptr() as usize, new_layout.align()) {
            let new = self.allocate_layout(new_layout);
            new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), new_layout.size());
            self.free(ptr);
            return Ok(nonnull_slice_from_raw_parts(new, new_layout.size()));
        }

        let new = self.reallocate_layout(ptr, old_layout, new_layout.size());
        Ok(nonnull_slice_from_raw_parts(new, new_layout.size()))
    }
}

#[inline(always)]
fn dangling(layout: Layout) -> NonNull<u8> {
    // SAFETY: alignments are nonzero
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `nn` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(nn.as_ptr(), len)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, test_utils::xmalloc};

    #[test]
    fn vec_through_allocator_api() {
        let xm = xmalloc(Config::new().with_kernel_map(false));

        let mut v = allocator_api2::vec::Vec::new_in(&*xm);
        for i in 0..100_000u32 {
            v.push(i);
        }
        assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x));

        v.truncate(10);
        v.shrink_to_fit();
        assert_eq!(v.as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        drop(v);
        assert_eq!(xm.counters().allocated_bytes, 0);
    }

    #[test]
    fn global_alloc_respects_alignment() {
        let xm = xmalloc(Config::new().with_kernel_map(false));

        for align in [1, 8, 16, 64, 512, 4096, 16384] {
            let layout = Layout::from_size_align(100, align).unwrap();
            unsafe {
                let p = GlobalAlloc::alloc_zeroed(&*xm, layout);
                assert_eq!(p as usize % align, 0);
                assert!(core::slice::from_raw_parts(p, 100).iter().all(|&b| b == 0));
                p.write_bytes(0x5A, 100);

                let q = GlobalAlloc::realloc(&*xm, p, layout, 10_000);
                assert_eq!(q as usize % align, 0);
                assert!(core::slice::from_raw_parts(q, 100).iter().all(|&b| b == 0x5A));

                GlobalAlloc::dealloc(&*xm, q, Layout::from_size_align(10_000, align).unwrap());
            }
        }

        assert_eq!(xm.counters().allocated_bytes, 0);
        xm.check().unwrap();
    }

    #[test]
    fn zero_sized_requests_are_dangling() {
        let xm = xmalloc(Config::new().with_kernel_map(false));
        let layout = Layout::from_size_align(0, 64).unwrap();

        let p = Allocator::allocate(&*xm, layout).unwrap();
        assert_eq!(p.cast::<u8>().as_ptr() as usize, 64);
        unsafe { Allocator::deallocate(&*xm, p.cast(), layout) };
        assert_eq!(xm.counters().allocation_count, 0);
    }
}
