//! Block managers: one per size class, owning that class's token pools.
//!
//! The pools live in a vector partitioned by state:
//!
//! ```text
//! [ full ... | free ... | empty ... ]
//!             ^ free_index           (empties gather at the tail)
//! ```
//!
//! Allocation always goes to the pool at `free_index`, creating a new
//! pool when every existing one is full. Frees arrive through the
//! owning pool and rebalance the partition at the two transition
//! moments: a full pool rejoining the free region, and a free pool
//! draining empty. Empty pools are only returned to the platform once
//! they outweigh the occupied pools by a hysteresis ratio, and the
//! sweep then drops the whole empty tail, so the class neither hoards
//! dead pools nor thrashes at the threshold.

use std::ptr::NonNull;

use crate::manager::PoolIndex;
use crate::pool::{self, TokenManager};
use crate::trace::{debug_log, warn_log};

/// Ratio of empty to occupied pools above which the empty tail is
/// released back to the platform.
pub(crate) const SWEEP_HYSTERESIS: f64 = 0.125;

pub(crate) struct BlockManager {
    pool_size: usize,
    pub(crate) block_size: usize,
    /// Request pools aligned to `pool_size`.
    align: bool,
    /// All pools of this class, partitioned {full | free | empty}.
    data: Vec<NonNull<TokenManager>>,
    /// Pools below this index are full; at or above it, non-full.
    free_index: usize,
    sweep_hysteresis: f64,
    /// True while every pool of this class is aligned to `pool_size`.
    pub(crate) aligned: bool,
    /// This manager's index within the parent, stamped into pool headers
    /// so a free can find its way back here.
    class_index: u32,
}

impl BlockManager {
    pub(crate) fn new(pool_size: usize, block_size: usize, align: bool, class_index: u32) -> Self {
        Self {
            pool_size,
            block_size,
            align,
            data: Vec::new(),
            free_index: 0,
            sweep_hysteresis: SWEEP_HYSTERESIS,
            aligned: true,
            class_index,
        }
    }

    /// Hand out one block. O(1) amortized: a new pool is created only
    /// when every existing pool is full.
    pub(crate) fn alloc(&mut self, pools: &mut PoolIndex) -> *mut u8 {
        if self.free_index == self.data.len() {
            let tm = pool::create(self.pool_size, self.block_size, self.align, self.class_index);
            // SAFETY: tm is live; it was created just above.
            unsafe {
                (*tm.as_ptr()).slot_index = self.data.len();
                if self.aligned && !(*tm.as_ptr()).aligned {
                    self.aligned = false;
                    warn_log!(block_size = self.block_size, "pool alignment lost");
                }
            }
            pools.register(tm);
            self.data.push(tm);
        }

        let child = self.data[self.free_index];
        // SAFETY: child is live and, by the partition invariant, not full.
        unsafe {
            let ptr = pool::alloc(child);
            if pool::is_full(child) {
                self.free_index += 1;
            }
            ptr
        }
    }

    /// Free `ptr` through its owning pool `child`, then rebalance the
    /// partition around the state transitions the free caused.
    ///
    /// # Safety
    /// `child` must be one of this manager's live pools and `ptr` a
    /// live block within it.
    pub(crate) unsafe fn free(
        &mut self,
        child: NonNull<TokenManager>,
        ptr: *mut u8,
        pools: &mut PoolIndex,
    ) {
        // SAFETY: per contract.
        let (was_full, now_empty) = unsafe { pool::free(child, ptr) };
        if was_full {
            self.full_to_free(child);
        }
        if now_empty {
            self.free_to_empty(child, pools);
        }
    }

    /// A full pool went non-full: swap it to the head of the non-full
    /// region, extending that region down by one.
    fn full_to_free(&mut self, child: NonNull<TokenManager>) {
        debug_assert!(self.free_index > 0);
        self.free_index -= 1;
        // SAFETY: child is live.
        let child_index = unsafe { (*child.as_ptr()).slot_index };
        self.swap_slots(child_index, self.free_index);
    }

    /// A free pool drained empty: gather it into the empty tail, and
    /// once empties outweigh occupied pools by the hysteresis ratio,
    /// release the entire tail.
    fn free_to_empty(&mut self, child: NonNull<TokenManager>, pools: &mut PoolIndex) {
        // SAFETY: child is live.
        let child_index = unsafe { (*child.as_ptr()).slot_index };
        let mut empty_tail = self.empty_tail();
        if empty_tail < self.data.len() {
            let swap_index = self.data.len() - empty_tail - 1;
            // A child already inside the trailing run was counted by the
            // scan; swapping it with the non-empty pool at swap_index
            // would break the partition. Only pull it in from below.
            if child_index < swap_index {
                self.swap_slots(child_index, swap_index);
                empty_tail += 1;
            }
        }

        if empty_tail as f64 > (self.data.len() - empty_tail) as f64 * self.sweep_hysteresis {
            debug_log!(block_size = self.block_size, empty_tail, "sweeping empty pool tail");
            while let Some(&last) = self.data.last() {
                // SAFETY: pools in data are live.
                if !unsafe { pool::is_empty(last) } {
                    break;
                }
                self.data.pop();
                pools.deregister(last);
                // SAFETY: last is empty and no longer referenced anywhere.
                unsafe { pool::destroy(last) };
            }
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.data.swap(a, b);
        // SAFETY: both pools are live; their headers track their slots.
        unsafe {
            (*self.data[a].as_ptr()).slot_index = a;
            (*self.data[b].as_ptr()).slot_index = b;
        }
    }

    /// Number of empty pools forming the tail of the vector.
    fn empty_tail(&self) -> usize {
        let mut boundary = self.data.len();
        // SAFETY: pools in data are live.
        while boundary > 0 && unsafe { pool::is_empty(self.data[boundary - 1]) } {
            boundary -= 1;
        }
        self.data.len() - boundary
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently granted out of this class.
    pub(crate) fn granted_bytes(&self) -> usize {
        // SAFETY: pools in data are live.
        self.data.iter().map(|&tm| unsafe { pool::granted_bytes(tm) }).sum()
    }

    /// Number of live blocks in this class.
    pub(crate) fn live_blocks(&self) -> usize {
        // SAFETY: pools in data are live.
        self.data.iter().map(|&tm| unsafe { pool::live_blocks(tm) }).sum()
    }

    /// Total pool bytes this class costs the process.
    pub(crate) fn footprint(&self) -> usize {
        // SAFETY: pools in data are live.
        self.data.iter().map(|&tm| unsafe { pool::footprint(tm) }).sum()
    }

    /// Visit every live block of this class as `(address, block_size)`.
    pub(crate) fn for_each_live(&self, f: &mut dyn FnMut(*mut u8, usize)) {
        for &tm in &self.data {
            // SAFETY: pools in data are live.
            unsafe { pool::for_each_live(tm, f) };
        }
    }

    /// Assert the partition invariants and every pool's own invariants.
    #[cfg(any(test, feature = "error-scanning"))]
    pub(crate) fn scan_for_errors(&self) {
        let empty_tail = self.empty_tail();
        for (i, &tm) in self.data.iter().enumerate() {
            // SAFETY: pools in data are live.
            unsafe {
                assert_eq!((*tm.as_ptr()).slot_index, i, "slot index out of sync");
                assert_eq!((*tm.as_ptr()).block_size, self.block_size);
                pool::scan_for_errors(tm);
                if i < self.free_index {
                    assert!(pool::is_full(tm), "full region holds a non-full pool");
                } else {
                    assert!(!pool::is_full(tm), "free region holds a full pool");
                }
                if i < self.data.len() - empty_tail {
                    assert!(!pool::is_empty(tm), "empty pool outside the trailing run");
                }
            }
        }
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        for &tm in &self.data {
            // SAFETY: this manager owns its pools; nothing can reach
            // them once it is gone.
            unsafe { pool::destroy(tm) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::reserved_blocks;

    const POOL_SIZE: usize = 1024;
    const BLOCK_SIZE: usize = 8;

    fn capacity_per_pool() -> usize {
        POOL_SIZE / BLOCK_SIZE - reserved_blocks(POOL_SIZE, BLOCK_SIZE)
    }

    fn manager() -> (BlockManager, PoolIndex) {
        (BlockManager::new(POOL_SIZE, BLOCK_SIZE, true, 0), PoolIndex::new())
    }

    /// Free a block through the pool the index resolves for it.
    unsafe fn free_via_lookup(bm: &mut BlockManager, pools: &mut PoolIndex, ptr: *mut u8) {
        let tm = pools.owner_of(ptr as usize, POOL_SIZE).expect("block has an owner");
        unsafe { bm.free(tm, ptr, pools) };
    }

    #[test]
    fn overflow_into_a_second_pool() {
        let (mut bm, mut pools) = manager();
        let capacity = capacity_per_pool();

        let blocks: Vec<*mut u8> = (0..capacity + 1).map(|_| bm.alloc(&mut pools)).collect();
        assert_eq!(bm.pool_count(), 2);
        assert_eq!(bm.live_blocks(), capacity + 1);
        assert_eq!(bm.granted_bytes(), (capacity + 1) * BLOCK_SIZE);
        bm.scan_for_errors();

        for &ptr in blocks.iter().rev() {
            unsafe { free_via_lookup(&mut bm, &mut pools, ptr) };
            bm.scan_for_errors();
        }
        assert_eq!(bm.live_blocks(), 0);
        // Both pools drained; the sweep collapses the class to nothing.
        assert_eq!(bm.pool_count(), 0);
        assert_eq!(pools.len(), 0);
    }

    #[test]
    fn sweep_waits_for_the_hysteresis_threshold() {
        let (mut bm, mut pools) = manager();
        let capacity = capacity_per_pool();
        let pool_count = 9;

        // Fill nine pools, keeping per-pool groups of block addresses.
        let groups: Vec<Vec<*mut u8>> = (0..pool_count)
            .map(|_| (0..capacity).map(|_| bm.alloc(&mut pools)).collect())
            .collect();
        assert_eq!(bm.pool_count(), pool_count);

        // One empty pool against eight occupied: 1 > 8 * 0.125 is false,
        // so the empty pool is retained.
        for &ptr in &groups[8] {
            unsafe { free_via_lookup(&mut bm, &mut pools, ptr) };
        }
        assert_eq!(bm.pool_count(), pool_count);
        bm.scan_for_errors();

        // A second empty pool tips the ratio; the sweep drops the whole
        // empty tail.
        for &ptr in &groups[7] {
            unsafe { free_via_lookup(&mut bm, &mut pools, ptr) };
        }
        assert_eq!(bm.pool_count(), pool_count - 2);
        bm.scan_for_errors();

        for group in &groups[..7] {
            for &ptr in group {
                unsafe { free_via_lookup(&mut bm, &mut pools, ptr) };
            }
        }
        assert_eq!(bm.pool_count(), 0);
        assert_eq!(pools.len(), 0);
    }

    #[test]
    fn freed_full_pool_serves_the_next_allocation() {
        let (mut bm, mut pools) = manager();
        let capacity = capacity_per_pool();

        let mut blocks: Vec<*mut u8> = (0..capacity).map(|_| bm.alloc(&mut pools)).collect();
        assert_eq!(bm.pool_count(), 1);

        // The pool is full; freeing one block must reopen it rather
        // than letting the next allocation spawn a second pool.
        let reopened = blocks.pop().unwrap();
        unsafe { free_via_lookup(&mut bm, &mut pools, reopened) };
        let replacement = bm.alloc(&mut pools);
        assert_eq!(replacement, reopened);
        assert_eq!(bm.pool_count(), 1);
        bm.scan_for_errors();

        blocks.push(replacement);
        for &ptr in &blocks {
            unsafe { free_via_lookup(&mut bm, &mut pools, ptr) };
        }
        assert_eq!(bm.pool_count(), 0);
    }
}
