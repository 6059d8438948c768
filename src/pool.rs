//! Token pools: fixed-size-block memory with an intrusive header.
//!
//! A pool is a power-of-two-sized region carved into equal blocks. Each
//! free block is identified by a *token* — its block index — and the
//! tokens of free blocks live in a stack embedded at the head of the
//! pool, right after the [`TokenManager`] header. An allocation
//! consumes the token at the stack position, a free pushes the derived
//! token back; both are O(1).
//!
//! Because the header occupies the pool's base, the blocks covering the
//! header and the token stack can never be handed out. Token 0 in
//! particular always addresses the header, which is what makes a zero
//! entry usable as the fullness sentinel: the initial free list ends in
//! a 0, and reading 0 at the stack position means every real token has
//! been consumed.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::{die, Fault};
use crate::platform::{self, TBMAN_ALIGN};
use crate::trace::trace_log;

/// Tokens are 16-bit block indices, so a pool holds at most this many blocks.
pub(crate) const MAX_BLOCKS_PER_POOL: usize = 0x10000;

/// Pool header. Lives at the base of the pool it manages; the token
/// stack (`stack_size` entries of `u16`) follows immediately after.
///
/// Keeping the header inside the pool lets the manager recover it from
/// any pointer into the pool — by masking with `!(pool_size - 1)` when
/// the pool is aligned to its own size, or from the pool-address tree
/// otherwise.
#[repr(C)]
pub(crate) struct TokenManager {
    pub pool_size: usize,
    pub block_size: usize,
    /// Alignment the pool memory was requested with; reused to rebuild
    /// the deallocation layout.
    alloc_align: usize,
    /// Current slot in the owning block manager's pool vector.
    pub slot_index: usize,
    /// Index of the owning block manager within the top-level manager.
    pub class_index: u32,
    /// Number of blocks the pool is carved into (`pool_size / block_size`).
    stack_size: u32,
    /// Number of blocks currently allocated; also the stack position of
    /// the next token to hand out.
    stack_index: u32,
    /// Whether the pool base address is a multiple of `pool_size`.
    pub aligned: bool,
}

#[inline]
unsafe fn token_stack(tm: NonNull<TokenManager>) -> *mut u16 {
    // SAFETY: the stack begins directly after the header, inside the
    // pool allocation.
    unsafe { tm.as_ptr().cast::<u8>().add(size_of::<TokenManager>()).cast() }
}

/// Number of blocks at the pool base covered by the header and the
/// token stack. These blocks are never handed out.
pub(crate) fn reserved_blocks(pool_size: usize, block_size: usize) -> usize {
    let stack_size = pool_size / block_size;
    let reserved_size = size_of::<TokenManager>() + size_of::<u16>() * stack_size;
    reserved_size / block_size + usize::from(reserved_size % block_size > 0)
}

/// Create a pool of `pool_size` bytes carved into `block_size` blocks.
///
/// The pool is requested from the platform aligned to its own size when
/// `align` is set (falling back to [`TBMAN_ALIGN`] if the platform
/// refuses), and the `aligned` header flag records what the platform
/// actually delivered. Fatal on invalid geometry or exhaustion.
pub(crate) fn create(
    pool_size: usize,
    block_size: usize,
    align: bool,
    class_index: u32,
) -> NonNull<TokenManager> {
    if !pool_size.is_power_of_two() {
        die!("create", Fault::PoolSizeNotPowerOfTwo(pool_size));
    }
    let stack_size = pool_size / block_size;
    if stack_size > MAX_BLOCKS_PER_POOL {
        die!("create", Fault::TooManyBlocks(stack_size));
    }
    let reserved = reserved_blocks(pool_size, block_size);
    if stack_size < reserved + 1 {
        die!("create", Fault::PoolTooSmall(pool_size, block_size));
    }

    let mut alloc_align = pool_size;
    let mut base = if align { platform::aligned_alloc(pool_size, pool_size) } else { std::ptr::null_mut() };
    if base.is_null() {
        alloc_align = TBMAN_ALIGN;
        base = platform::aligned_alloc(pool_size, TBMAN_ALIGN);
    }
    let Some(base) = NonNull::new(base) else { die!("create", Fault::OutOfMemory(pool_size)) };

    let tm = base.cast::<TokenManager>();
    // SAFETY: the allocation spans pool_size bytes, which covers the
    // header and the token stack (checked against reserved above).
    unsafe {
        tm.as_ptr().write(TokenManager {
            pool_size,
            block_size,
            alloc_align,
            slot_index: 0,
            class_index,
            stack_size: stack_size as u32,
            stack_index: 0,
            aligned: base.as_ptr() as usize & (pool_size - 1) == 0,
        });

        // Initial free list: tokens of all non-reserved blocks in
        // address order, capped by the zero sentinel.
        let stack = token_stack(tm);
        for i in 0..stack_size {
            let token = i + reserved;
            stack.add(i).write(if token < stack_size { token as u16 } else { 0 });
        }
    }

    trace_log!(
        base = base.as_ptr() as usize,
        pool_size,
        block_size,
        "pool created"
    );
    tm
}

/// Release the pool memory. The header is gone afterwards.
///
/// # Safety
/// `tm` must be a live pool from [`create`], no longer referenced anywhere.
pub(crate) unsafe fn destroy(tm: NonNull<TokenManager>) {
    // SAFETY: size and alignment are those the pool was created with.
    unsafe {
        let header = tm.as_ptr();
        trace_log!(base = header as usize, "pool destroyed");
        platform::aligned_free(header.cast(), (*header).pool_size, (*header).alloc_align);
    }
}

/// A pool is full when the stack position holds the zero sentinel.
///
/// # Safety
/// `tm` must be a live pool.
#[inline]
pub(crate) unsafe fn is_full(tm: NonNull<TokenManager>) -> bool {
    // SAFETY: stack_index <= stack_size - 1 always holds (the sentinel
    // stops it short of the end), so the read is in bounds.
    unsafe { token_stack(tm).add((*tm.as_ptr()).stack_index as usize).read() == 0 }
}

/// A pool is empty when no blocks are allocated from it.
///
/// # Safety
/// `tm` must be a live pool.
#[inline]
pub(crate) unsafe fn is_empty(tm: NonNull<TokenManager>) -> bool {
    // SAFETY: plain header read.
    unsafe { (*tm.as_ptr()).stack_index == 0 }
}

/// Hand out the next free block. O(1).
///
/// # Safety
/// `tm` must be a live pool that is not full.
pub(crate) unsafe fn alloc(tm: NonNull<TokenManager>) -> *mut u8 {
    // SAFETY: per contract the pool is not full, so the token at the
    // stack position is a real block index inside the pool.
    unsafe {
        let header = tm.as_ptr();
        let token = token_stack(tm).add((*header).stack_index as usize).read() as usize;
        debug_assert!(token != 0, "allocation from a full pool");
        (*header).stack_index += 1;
        header.cast::<u8>().add(token * (*header).block_size)
    }
}

/// Return `ptr`'s block to the pool. O(1).
///
/// Reports `(was_full, is_now_empty)` so the owning block manager can
/// maintain its partition at the transition moments.
///
/// # Safety
/// `ptr` must be a block address previously handed out by [`alloc`] on
/// this pool and not freed since.
pub(crate) unsafe fn free(tm: NonNull<TokenManager>, ptr: *mut u8) -> (bool, bool) {
    // SAFETY: per contract ptr lies within this pool's span.
    unsafe {
        let header = tm.as_ptr();
        let offset = ptr as usize - header as usize;

        debug_assert!((*header).stack_index != 0, "free on an empty pool");
        debug_assert!(offset < (*header).pool_size, "free of an address outside the pool");

        let token = offset / (*header).block_size;
        debug_assert!(
            token >= reserved_blocks((*header).pool_size, (*header).block_size),
            "free of the reserved pool region"
        );
        #[cfg(debug_assertions)]
        for i in (*header).stack_index as usize..(*header).stack_size as usize {
            let free_token = token_stack(tm).add(i).read();
            assert!(free_token as usize != token, "double free of {ptr:p}");
        }

        let was_full = is_full(tm);
        (*header).stack_index -= 1;
        token_stack(tm).add((*header).stack_index as usize).write(token as u16);
        (was_full, (*header).stack_index == 0)
    }
}

/// Number of blocks a pool can hand out in total.
///
/// # Safety
/// `tm` must be a live pool.
pub(crate) unsafe fn capacity(tm: NonNull<TokenManager>) -> usize {
    // SAFETY: plain header reads.
    unsafe {
        let header = tm.as_ptr();
        (*header).stack_size as usize - reserved_blocks((*header).pool_size, (*header).block_size)
    }
}

/// Bytes currently granted out of this pool.
///
/// # Safety
/// `tm` must be a live pool.
pub(crate) unsafe fn granted_bytes(tm: NonNull<TokenManager>) -> usize {
    // SAFETY: plain header reads.
    unsafe { (*tm.as_ptr()).block_size * (*tm.as_ptr()).stack_index as usize }
}

/// Number of live blocks in this pool.
///
/// # Safety
/// `tm` must be a live pool.
pub(crate) unsafe fn live_blocks(tm: NonNull<TokenManager>) -> usize {
    // SAFETY: plain header read.
    unsafe { (*tm.as_ptr()).stack_index as usize }
}

/// Total bytes this pool costs the process: the pool span plus the
/// token stack accounted separately.
///
/// # Safety
/// `tm` must be a live pool.
pub(crate) unsafe fn footprint(tm: NonNull<TokenManager>) -> usize {
    // SAFETY: plain header reads.
    unsafe { (*tm.as_ptr()).pool_size + (*tm.as_ptr()).stack_size as usize * size_of::<u16>() }
}

/// Visit every live block as `(address, block_size)`. Live tokens
/// occupy the stack prefix `[0, stack_index)` in allocation order.
///
/// # Safety
/// `tm` must be a live pool.
pub(crate) unsafe fn for_each_live(tm: NonNull<TokenManager>, f: &mut dyn FnMut(*mut u8, usize)) {
    // SAFETY: the prefix holds tokens of blocks inside the pool.
    unsafe {
        let header = tm.as_ptr();
        for i in 0..(*header).stack_index as usize {
            let token = token_stack(tm).add(i).read() as usize;
            f(header.cast::<u8>().add(token * (*header).block_size), (*header).block_size);
        }
    }
}

/// Assert the per-pool invariants: the stack position is in range and
/// the live token prefix holds pairwise distinct, non-reserved tokens.
///
/// # Safety
/// `tm` must be a live pool.
#[cfg(any(test, feature = "error-scanning"))]
pub(crate) unsafe fn scan_for_errors(tm: NonNull<TokenManager>) {
    // SAFETY: reads stay within the header and the token stack.
    unsafe {
        let header = tm.as_ptr();
        let stack_size = (*header).stack_size as usize;
        let stack_index = (*header).stack_index as usize;
        let reserved = reserved_blocks((*header).pool_size, (*header).block_size);

        assert!(stack_index <= stack_size - reserved);

        let mut seen = vec![false; stack_size];
        for i in 0..stack_index {
            let token = token_stack(tm).add(i).read() as usize;
            assert!(token >= reserved, "live token {token} points into the reserved region");
            assert!(token < stack_size);
            assert!(!seen[token], "duplicate live token {token}");
            seen[token] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_for_test(pool_size: usize, block_size: usize) -> NonNull<TokenManager> {
        create(pool_size, block_size, true, 0)
    }

    #[test]
    fn geometry() {
        let pool_size = 4096;
        let block_size = 64;
        let reserved = reserved_blocks(pool_size, block_size);
        let tm = create_for_test(pool_size, block_size);

        unsafe {
            assert!((*tm.as_ptr()).aligned);
            assert_eq!(tm.as_ptr() as usize % pool_size, 0);
            assert_eq!(capacity(tm), pool_size / block_size - reserved);
            assert!(is_empty(tm));
            assert!(!is_full(tm));

            // The first block handed out sits just past the reserved region.
            let first = alloc(tm);
            assert_eq!(first as usize, tm.as_ptr() as usize + reserved * block_size);
            let (was_full, now_empty) = free(tm, first);
            assert!(!was_full);
            assert!(now_empty);

            destroy(tm);
        }
    }

    #[test]
    fn fill_drain_and_refill() {
        let tm = create_for_test(4096, 64);

        unsafe {
            let capacity = capacity(tm);
            let mut blocks: Vec<*mut u8> = (0..capacity).map(|_| alloc(tm)).collect();
            assert!(is_full(tm));
            assert_eq!(live_blocks(tm), capacity);
            assert_eq!(granted_bytes(tm), capacity * 64);
            scan_for_errors(tm);

            // Distinct, block-granular addresses.
            blocks.sort_unstable();
            blocks.dedup();
            assert_eq!(blocks.len(), capacity);
            for pair in blocks.windows(2) {
                assert_eq!(pair[1] as usize - pair[0] as usize, 64);
            }

            for &block in blocks.iter().rev() {
                free(tm, block);
                scan_for_errors(tm);
            }
            assert!(is_empty(tm));
            assert_eq!(granted_bytes(tm), 0);

            // The pool is reusable after a full drain.
            let again = alloc(tm);
            assert!(!again.is_null());
            free(tm, again);

            destroy(tm);
        }
    }

    #[test]
    fn full_and_empty_transitions_are_reported() {
        let tm = create_for_test(4096, 1024);

        unsafe {
            // 4096 / 1024 = 4 blocks, 1 reserved: capacity 3.
            assert_eq!(capacity(tm), 3);
            let a = alloc(tm);
            let b = alloc(tm);
            let c = alloc(tm);
            assert!(is_full(tm));

            assert_eq!(free(tm, c), (true, false));
            assert_eq!(free(tm, a), (false, false));
            assert_eq!(free(tm, b), (false, true));

            destroy(tm);
        }
    }

    #[test]
    fn for_each_live_walks_the_prefix() {
        let tm = create_for_test(4096, 64);

        unsafe {
            let blocks: Vec<*mut u8> = (0..5).map(|_| alloc(tm)).collect();
            let mut seen = Vec::new();
            for_each_live(tm, &mut |ptr, size| {
                assert_eq!(size, 64);
                seen.push(ptr);
            });
            assert_eq!(seen, blocks);

            for block in blocks {
                free(tm, block);
            }
            destroy(tm);
        }
    }

    #[test]
    fn unaligned_pools_still_serve_blocks() {
        let tm = create(4096, 64, false, 0);

        unsafe {
            // The fallback request only guarantees TBMAN_ALIGN.
            assert_eq!(tm.as_ptr() as usize % TBMAN_ALIGN, 0);
            let block = alloc(tm);
            free(tm, block);
            destroy(tm);
        }
    }
}
