//! Locks and ownership flags used throughout the allocator.
//!
//! Every lock is a `lock_api` lock over a spinning raw mutex: parking locks
//! may allocate, which the allocator cannot afford.

use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

pub(crate) type RawLock = spin::Mutex<()>;

pub(crate) type Mutex<T> = lock_api::Mutex<RawLock, T>;

pub(crate) type ReentrantMutex<T> = lock_api::ReentrantMutex<RawLock, ThreadId, T>;

/// Identifies the calling thread for [`lock_api::ReentrantMutex`].
///
/// Backed by `pthread_self(3)`. Without the `system-backed` feature every
/// caller is treated as the same thread, and the allocator must then only be
/// used from a single thread.
#[derive(Debug)]
pub struct ThreadId;

unsafe impl lock_api::GetThreadId for ThreadId {
    const INIT: Self = ThreadId;

    #[inline]
    fn nonzero_thread_id(&self) -> NonZeroUsize {
        current_thread()
    }
}

#[cfg(all(feature = "system-backed", unix))]
#[inline]
pub(crate) fn current_thread() -> NonZeroUsize {
    let id = unsafe { libc::pthread_self() } as usize;
    NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(not(all(feature = "system-backed", unix)))]
#[inline]
pub(crate) fn current_thread() -> NonZeroUsize {
    NonZeroUsize::MIN
}

/// Outcome of [`OwnerFlag::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The flag was free and now belongs to the calling thread.
    Acquired,
    /// The calling thread already holds the flag further up the stack.
    Recursive,
    /// Another thread holds the flag.
    Busy,
}

/// A flag recording which thread is inside a non-reentrant section.
///
/// Unlike a lock, re-entry by the owning thread is reported rather than
/// deadlocking, so the caller can fall back to a path that needs no progress
/// from the outer frame.
#[derive(Debug)]
pub(crate) struct OwnerFlag(AtomicUsize);

impl OwnerFlag {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn claim(&self) -> Claim {
        let me = current_thread().get();

        match self.0.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Claim::Acquired,
            Err(owner) if owner == me => Claim::Recursive,
            Err(_) => Claim::Busy,
        }
    }

    /// Releases the flag. Must only be called by the thread that acquired it.
    pub fn release(&self) {
        debug_assert_eq!(self.0.load(Ordering::Relaxed), current_thread().get());
        self.0.store(0, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    pub fn is_held_by_me(&self) -> bool {
        self.0.load(Ordering::Relaxed) == current_thread().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_flag_claims() {
        let flag = OwnerFlag::new();

        assert!(!flag.is_held());
        assert_eq!(flag.claim(), Claim::Acquired);
        assert!(flag.is_held_by_me());
        assert_eq!(flag.claim(), Claim::Recursive);

        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(flag.claim(), Claim::Busy));
        });

        flag.release();
        assert!(!flag.is_held());
    }

    #[test]
    fn reentrant_mutex_allows_nesting() {
        let m: ReentrantMutex<core::cell::Cell<u32>> =
            ReentrantMutex::new(core::cell::Cell::new(0));

        let outer = m.lock();
        outer.set(1);
        {
            let inner = m.lock();
            inner.set(inner.get() + 1);
        }
        assert_eq!(outer.get(), 2);
    }
}
