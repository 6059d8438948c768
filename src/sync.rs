//! [`TbmanLock`] wraps a [`Tbman`] in a mutex for use across threads.
//!
//! Every public entry point acquires the lock for the full duration of
//! its work, making operations linearizable in lock-acquisition order.
//! There is no locking below the manager: block managers and pools are
//! only ever reached through it.

use std::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator, Layout};

use crate::manager::{Grant, Status, Tbman, TbmanConfig};

/// Wraps a mutex-locked [`Tbman`].
///
/// The mutex implementation is pluggable through
/// [`lock_api::RawMutex`]; [`SyncTbman`] picks the parking-lot mutex,
/// which is the right default on std targets.
pub struct TbmanLock<R: lock_api::RawMutex> {
    mutex: lock_api::Mutex<R, Tbman>,
}

/// [`TbmanLock`] backed by [`parking_lot::RawMutex`].
pub type SyncTbman = TbmanLock<parking_lot::RawMutex>;

impl<R: lock_api::RawMutex> TbmanLock<R> {
    /// Create a new [`TbmanLock`]. Fatal on invalid configuration.
    pub fn new(config: &TbmanConfig) -> Self {
        Self { mutex: lock_api::Mutex::new(Tbman::new(config)) }
    }

    /// Lock the mutex and access the inner [`Tbman`].
    #[track_caller]
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Tbman> {
        self.mutex.lock()
    }

    /// Returns a mutable reference to the inner [`Tbman`].
    ///
    /// This avoids locking, as having a mutable reference statically
    /// guarantees that `self` is not locked.
    pub fn get_mut(&mut self) -> &mut Tbman {
        self.mutex.get_mut()
    }

    /// Retrieve the inner [`Tbman`].
    pub fn into_inner(self) -> Tbman {
        self.mutex.into_inner()
    }

    /// Unified malloc/realloc/free; see [`Tbman::alloc`].
    ///
    /// # Safety
    /// `current_ptr` must be null or a live block granted by this
    /// manager and not freed since.
    pub unsafe fn alloc(&self, current_ptr: *mut u8, requested_size: usize) -> Grant {
        // SAFETY: per contract.
        unsafe { self.lock().alloc(current_ptr, requested_size) }
    }

    /// [`Self::alloc`] with a size hint; see [`Tbman::nalloc`].
    ///
    /// # Safety
    /// `current_size` must be zero or a size this manager granted for
    /// `current_ptr`, with `current_ptr` live and not freed since.
    pub unsafe fn nalloc(
        &self,
        current_ptr: *mut u8,
        current_size: usize,
        requested_size: usize,
    ) -> Grant {
        // SAFETY: per contract.
        unsafe { self.lock().nalloc(current_ptr, current_size, requested_size) }
    }

    /// Usable bytes behind `ptr`; 0 for pointers this manager never granted.
    pub fn granted_space(&self, ptr: *const u8) -> usize {
        self.lock().granted_space(ptr)
    }

    /// Sum of granted bytes over every live block.
    pub fn total_granted_space(&self) -> usize {
        self.lock().total_granted_space()
    }

    /// Number of live blocks.
    pub fn total_instances(&self) -> usize {
        self.lock().total_instances()
    }

    /// A point-in-time summary of the manager's shape and load.
    pub fn status(&self) -> Status {
        self.lock().status()
    }

    /// Visit every live block as `(address, granted_size)`.
    ///
    /// The blocks are snapshot under the lock and the callback runs
    /// after it is released, so the callback is free to allocate
    /// through this manager without deadlocking.
    pub fn for_each_instance(&self, mut f: impl FnMut(*mut u8, usize)) {
        let snapshot = self.lock().collect_instances();
        for (ptr, size) in snapshot {
            f(ptr, size);
        }
    }
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(ptr: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `ptr` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) }
}

unsafe impl<R: lock_api::RawMutex> Allocator for TbmanLock<R> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        let grant =
            self.lock().alloc_layout(layout.size(), layout.align()).ok_or(AllocError)?;
        // alloc_layout faults rather than returning null on exhaustion.
        debug_assert!(!grant.ptr.is_null());
        // SAFETY: grant.ptr is a non-null block of grant.size bytes.
        Ok(nonnull_slice_from_raw_parts(unsafe { NonNull::new_unchecked(grant.ptr) }, grant.size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // Layouts don't carry the granted size, so the free always
            // takes the lookup path rather than the masking fast path.
            // SAFETY: guaranteed by the caller that `ptr` is a live
            // block of this allocator.
            unsafe { self.lock().mem_free(ptr.as_ptr(), None) };
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
            return self.allocate(new_layout);
        }

        let new_block = self.allocate(new_layout)?;
        // SAFETY: the old and new blocks are live and disjoint; the new
        // block holds at least old_layout.size() bytes.
        unsafe {
            new_block
                .cast::<u8>()
                .as_ptr()
                .copy_from_nonoverlapping(ptr.as_ptr(), old_layout.size());
            self.deallocate(ptr, old_layout);
        }
        Ok(new_block)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            // SAFETY: guaranteed by the caller.
            unsafe { self.deallocate(ptr, old_layout) };
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        let new_block = self.allocate(new_layout)?;
        // SAFETY: as in grow; the old block holds at least
        // new_layout.size() bytes.
        unsafe {
            new_block
                .cast::<u8>()
                .as_ptr()
                .copy_from_nonoverlapping(ptr.as_ptr(), new_layout.size());
            self.deallocate(ptr, old_layout);
        }
        Ok(new_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_entry_points_round_trip() {
        let man = SyncTbman::new(&TbmanConfig::default());
        unsafe {
            let grant = man.alloc(std::ptr::null_mut(), 48);
            assert_eq!(grant.size, 64);
            assert_eq!(man.granted_space(grant.ptr), 64);
            assert_eq!(man.total_instances(), 1);
            assert_eq!(man.total_granted_space(), 64);

            man.alloc(grant.ptr, 0);
            assert_eq!(man.total_instances(), 0);
        }
        man.lock().scan_for_errors();
    }

    #[test]
    fn callbacks_may_allocate_during_iteration() {
        let man = SyncTbman::new(&TbmanConfig::default());
        unsafe {
            let grant = man.alloc(std::ptr::null_mut(), 8);

            let mut visited = 0;
            man.for_each_instance(|ptr, size| {
                assert_eq!(ptr, grant.ptr);
                assert_eq!(size, 8);
                // Re-entering the allocator must not deadlock: the
                // snapshot lock is already released.
                let inner = man.alloc(std::ptr::null_mut(), 8);
                man.alloc(inner.ptr, 0);
                visited += 1;
            });
            assert_eq!(visited, 1);

            man.alloc(grant.ptr, 0);
        }
    }

    #[test]
    fn allocator_api_respects_alignment() {
        let man = SyncTbman::new(&TbmanConfig::default());

        for align in [1usize, 8, 64, 256] {
            let layout = Layout::from_size_align(48, align).unwrap();
            let block = man.allocate(layout).expect("allocate");
            assert_eq!(block.cast::<u8>().as_ptr() as usize % align, 0);
            assert!(block.len() >= 48);
            unsafe {
                block.cast::<u8>().as_ptr().write_bytes(0xee, 48);
                man.deallocate(block.cast::<u8>(), layout);
            }
        }

        // Alignments beyond TBMAN_ALIGN are not serviceable.
        let huge_align = Layout::from_size_align(64, 512).unwrap();
        assert!(man.allocate(huge_align).is_err());

        assert_eq!(man.total_instances(), 0);
        man.lock().scan_for_errors();
    }

    #[test]
    fn allocator_api_zero_size_and_regrowth() {
        let man = SyncTbman::new(&TbmanConfig::default());

        let zero = Layout::from_size_align(0, 1).unwrap();
        let dangling = man.allocate(zero).expect("zero-size allocate");
        assert_eq!(dangling.len(), 0);
        unsafe { man.deallocate(dangling.cast::<u8>(), zero) };

        let small = Layout::from_size_align(100, 8).unwrap();
        let large = Layout::from_size_align(5_000, 8).unwrap();
        let block = man.allocate(small).expect("allocate");
        unsafe {
            block.cast::<u8>().as_ptr().write_bytes(0x11, 100);
            let grown = man.grow(block.cast::<u8>(), small, large).expect("grow");
            assert_eq!(grown.cast::<u8>().as_ptr().add(99).read(), 0x11);
            let shrunk = man.shrink(grown.cast::<u8>(), large, small).expect("shrink");
            assert_eq!(shrunk.cast::<u8>().as_ptr().add(99).read(), 0x11);
            man.deallocate(shrunk.cast::<u8>(), small);
        }

        assert_eq!(man.total_instances(), 0);
        man.lock().scan_for_errors();
    }

    #[test]
    fn concurrent_churn_settles_to_zero() {
        let man = SyncTbman::new(&TbmanConfig::default());

        std::thread::scope(|scope| {
            for seed in 0..2u64 {
                let man = &man;
                scope.spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(seed + 1);
                    for _ in 0..10_000 {
                        let size = rng.usize(1..=20_000);
                        unsafe {
                            let grant = man.alloc(std::ptr::null_mut(), size);
                            assert!(grant.size >= size);
                            grant.ptr.write_bytes(0xcd, size.min(64));
                            if rng.bool() {
                                man.alloc(grant.ptr, 0);
                            } else {
                                man.nalloc(grant.ptr, grant.size, 0);
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(man.total_instances(), 0);
        assert_eq!(man.total_granted_space(), 0);
        man.lock().scan_for_errors();
    }
}
