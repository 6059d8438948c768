//! Token-based pool memory manager.
//!
//! tbman services small-to-medium allocation requests from size-class
//! pools with O(1) amortized cost and forwards oversize requests to the
//! platform allocator while still tracking them. Every pool carries its
//! own bookkeeping in an intrusive header, so a free can find the
//! owning pool either by masking the pointer (while all pools are
//! aligned to the pool size) or through an ordered address tree.
//!
//! Three tiers do the work:
//!
//! - a *token pool* (internal) owns one contiguous pool and serves
//!   alloc/free in O(1) from a stack of free block tokens,
//! - a *block manager* (internal) owns all pools of one block size and
//!   decides when pools are created and released,
//! - the [`manager::Tbman`] routes requests to the smallest fitting
//!   class, tracks oversize blocks, and answers introspection queries.
//!
//! Use [`TbmanLock`] (or the [`SyncTbman`] alias) to share a manager
//! between threads, or the process-wide singleton through [`open`] and
//! the free functions below.
//!
//! # Example
//!
//! ```
//! use tbman::{SyncTbman, TbmanConfig};
//!
//! let man = SyncTbman::new(&TbmanConfig::default());
//!
//! let grant = unsafe { man.alloc(std::ptr::null_mut(), 100) };
//! assert_eq!(grant.size, 128); // smallest fitting block class
//!
//! unsafe { man.alloc(grant.ptr, 0) }; // free
//! assert_eq!(man.total_granted_space(), 0);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod block;
mod error;
mod ladder;
mod platform;
mod pool;
mod trace;

pub mod manager;
pub mod sync;

pub use error::Fault;
pub use manager::{Grant, Status, Tbman, TbmanConfig};
pub use platform::TBMAN_ALIGN;
pub use sync::{SyncTbman, TbmanLock};

use std::sync::Once;

use error::die;

static GLOBAL: parking_lot::Mutex<Option<SyncTbman>> = parking_lot::Mutex::new(None);
static OPEN_ONCE: Once = Once::new();

fn try_global<T>(f: impl FnOnce(&SyncTbman) -> T) -> Option<T> {
    let global = GLOBAL.lock();
    global.as_ref().map(f)
}

/// Initialize the process-wide manager with the default configuration.
///
/// Call once at the beginning of the program; further calls are no-ops.
/// The manager cannot be re-opened after [`close`].
pub fn open() {
    OPEN_ONCE.call_once(|| {
        *GLOBAL.lock() = Some(SyncTbman::new(&TbmanConfig::default()));
    });
}

/// Tear the process-wide manager down.
///
/// Emits a warning naming the count and byte footprint of any still
/// live blocks.
pub fn close() {
    GLOBAL.lock().take();
}

/// Unified malloc/realloc/free against the process-wide manager; see
/// [`Tbman::alloc`].
///
/// # Safety
/// `current_ptr` must be null or a live block granted by the
/// process-wide manager and not freed since.
pub unsafe fn alloc(current_ptr: *mut u8, requested_size: usize) -> Grant {
    // SAFETY: per contract.
    match try_global(|man| unsafe { man.alloc(current_ptr, requested_size) }) {
        Some(grant) => grant,
        None => die!("alloc", Fault::NotOpen),
    }
}

/// [`alloc`] with a size hint enabling the masking fast path; see
/// [`Tbman::nalloc`].
///
/// # Safety
/// `current_size` must be zero or a size the process-wide manager
/// granted for `current_ptr`, with `current_ptr` live and not freed
/// since.
pub unsafe fn nalloc(current_ptr: *mut u8, current_size: usize, requested_size: usize) -> Grant {
    // SAFETY: per contract.
    match try_global(|man| unsafe { man.nalloc(current_ptr, current_size, requested_size) }) {
        Some(grant) => grant,
        None => die!("nalloc", Fault::NotOpen),
    }
}

/// Usable bytes behind `ptr`; 0 for pointers the process-wide manager
/// never granted.
pub fn granted_space(ptr: *const u8) -> usize {
    match try_global(|man| man.granted_space(ptr)) {
        Some(space) => space,
        None => die!("granted_space", Fault::NotOpen),
    }
}

/// Sum of granted bytes over every live block of the process-wide
/// manager.
pub fn total_granted_space() -> usize {
    match try_global(|man| man.total_granted_space()) {
        Some(space) => space,
        None => die!("total_granted_space", Fault::NotOpen),
    }
}

/// Number of live blocks of the process-wide manager.
pub fn total_instances() -> usize {
    match try_global(|man| man.total_instances()) {
        Some(count) => count,
        None => die!("total_instances", Fault::NotOpen),
    }
}

/// Visit every live block of the process-wide manager as
/// `(address, granted_size)`.
///
/// The blocks are snapshot under the manager's lock and the callback
/// runs after every lock is released, so the callback is free to
/// allocate.
pub fn for_each_instance(mut f: impl FnMut(*mut u8, usize)) {
    let snapshot = match try_global(|man| man.lock().collect_instances()) {
        Some(snapshot) => snapshot,
        None => die!("for_each_instance", Fault::NotOpen),
    };
    for (ptr, size) in snapshot {
        f(ptr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The veneer drives one process-wide manager, so everything lives
    // in a single test.
    #[test]
    fn process_wide_veneer() {
        open();
        open(); // idempotent

        unsafe {
            let grant = alloc(std::ptr::null_mut(), 100);
            assert_eq!(grant.size, 128);
            assert_eq!(granted_space(grant.ptr), 128);
            assert_eq!(total_instances(), 1);
            assert_eq!(total_granted_space(), 128);

            let mut seen = Vec::new();
            for_each_instance(|ptr, size| seen.push((ptr, size)));
            assert_eq!(seen, [(grant.ptr, 128)]);

            let resized = nalloc(grant.ptr, grant.size, 60);
            assert_eq!(resized.size, 64);

            nalloc(resized.ptr, resized.size, 0);
            assert_eq!(total_instances(), 0);
            assert_eq!(total_granted_space(), 0);
        }

        close();
    }
}
