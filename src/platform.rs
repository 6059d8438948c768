//! Platform aligned-allocation primitives.
//!
//! Thin wrappers over `std::alloc` that keep `Layout` construction in
//! one place, so every allocation is paired with a deallocation using
//! the same size and alignment.

use std::alloc::{alloc, dealloc, Layout};

/// Minimum alignment of externally serviced blocks and of pools that
/// could not be aligned to their own size.
///
/// Internal blocks are aligned to the largest power of two dividing
/// their block size; pools are preferably aligned to the pool size
/// itself, falling back to this value.
pub const TBMAN_ALIGN: usize = 0x100;

/// Allocate `size` bytes aligned to `align`. Returns null on exhaustion
/// or an unrepresentable layout; the caller decides whether that is
/// fatal or recoverable (pool creation falls back to a smaller
/// alignment first).
pub(crate) fn aligned_alloc(size: usize, align: usize) -> *mut u8 {
    debug_assert!(size != 0);
    debug_assert!(align.is_power_of_two());

    match Layout::from_size_align(size, align) {
        // SAFETY: size is nonzero.
        Ok(layout) => unsafe { alloc(layout) },
        Err(_) => std::ptr::null_mut(),
    }
}

/// Release memory obtained from [`aligned_alloc`].
///
/// # Safety
/// `ptr` must have been returned by [`aligned_alloc`] with exactly this
/// `size` and `align`, and not freed since.
pub(crate) unsafe fn aligned_free(ptr: *mut u8, size: usize, align: usize) {
    // SAFETY: the caller passes the size and alignment the block was
    // allocated with, so this layout matches the allocation's.
    unsafe { dealloc(ptr, Layout::from_size_align_unchecked(size, align)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_respects_alignment() {
        for align in [8, 64, TBMAN_ALIGN, 0x10000] {
            let ptr = aligned_alloc(0x10000, align);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);
            unsafe { aligned_free(ptr, 0x10000, align) };
        }
    }

    #[test]
    fn unrepresentable_layout_is_null() {
        assert!(aligned_alloc(usize::MAX - 8, 16).is_null());
    }
}
