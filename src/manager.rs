//! The top-level manager: size-class routing, pointer→owner lookup and
//! the external path for oversize requests.
//!
//! [`Tbman`] owns one [`BlockManager`](crate::block::BlockManager) per
//! rung of its block-size ladder and two indexes: an ordered set of
//! pool base addresses (answering "which pool owns this pointer" for
//! frees without a size hint) and an ordered map from external block
//! addresses to their granted sizes. Requests larger than the biggest
//! block class go straight to the platform allocator and are tracked in
//! the latter.
//!
//! [`Tbman`] itself is unsynchronized and allocates through `&mut self`;
//! wrap it in [`TbmanLock`](crate::sync::TbmanLock) to share it.

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use crate::block::BlockManager;
use crate::error::{die, Fault};
use crate::ladder;
use crate::platform::{self, TBMAN_ALIGN};
use crate::pool::{self, TokenManager};
use crate::trace::trace_log;

/// Result of an allocation request: the granted block and the number of
/// usable bytes behind it (the class's block size, or the requested
/// size for external blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// The granted block, or null for a pure free.
    pub ptr: *mut u8,
    /// Usable bytes behind `ptr`.
    pub size: usize,
}

impl Grant {
    /// The empty grant: what a pure free or a zero-size request yields.
    pub const NONE: Grant = Grant { ptr: std::ptr::null_mut(), size: 0 };

    /// Whether this grant carries no block.
    pub fn is_none(&self) -> bool {
        self.ptr.is_null()
    }
}

/// Manager construction parameters.
///
/// The defaults reproduce the reference configuration: 64 KiB pools,
/// block classes doubling from 8 bytes to 16 KiB, pools aligned to
/// their own size.
#[derive(Debug, Clone)]
pub struct TbmanConfig {
    /// Size of every pool in bytes. Must be a power of two.
    pub pool_size: usize,
    /// Smallest block class.
    pub min_block_size: usize,
    /// Upper bound for block classes; requests above the largest
    /// generated class are serviced externally.
    pub max_block_size: usize,
    /// Ladder stepping: 1 doubles between classes, larger values
    /// interleave arithmetic steps.
    pub stepping_method: usize,
    /// Request pools aligned to `pool_size`, enabling the masking fast
    /// path for size-hinted frees.
    pub full_align: bool,
}

impl Default for TbmanConfig {
    fn default() -> Self {
        Self {
            pool_size: 0x10000,
            min_block_size: 8,
            max_block_size: 1024 * 16,
            stepping_method: 1,
            full_align: true,
        }
    }
}

/// Ordered set of live pool base addresses.
///
/// Owner lookup walks to the largest registered base at or below the
/// queried pointer; the match is genuine iff the pointer lies within
/// one pool span of it.
pub(crate) struct PoolIndex {
    addresses: BTreeSet<usize>,
}

impl PoolIndex {
    pub(crate) fn new() -> Self {
        Self { addresses: BTreeSet::new() }
    }

    pub(crate) fn register(&mut self, tm: NonNull<TokenManager>) {
        let address = tm.as_ptr() as usize;
        if !self.addresses.insert(address) {
            die!("PoolIndex::register", Fault::PoolRegistration(address));
        }
    }

    pub(crate) fn deregister(&mut self, tm: NonNull<TokenManager>) {
        let address = tm.as_ptr() as usize;
        if !self.addresses.remove(&address) {
            die!("PoolIndex::deregister", Fault::PoolDeregistration(address));
        }
    }

    /// The pool owning `ptr`, if any registered pool span contains it.
    pub(crate) fn owner_of(&self, ptr: usize, pool_size: usize) -> Option<NonNull<TokenManager>> {
        let &base = self.addresses.range(..=ptr).next_back()?;
        // SAFETY: registered addresses are live pool headers.
        (ptr - base < pool_size).then(|| unsafe { NonNull::new_unchecked(base as *mut TokenManager) })
    }

    pub(crate) fn len(&self) -> usize {
        self.addresses.len()
    }
}

/// Ordered map from external block address to granted size.
struct ExternalIndex {
    blocks: BTreeMap<usize, usize>,
}

impl ExternalIndex {
    fn new() -> Self {
        Self { blocks: BTreeMap::new() }
    }

    fn register(&mut self, address: usize, size: usize) {
        if self.blocks.insert(address, size).is_some() {
            die!("ExternalIndex::register", Fault::ExternalRegistration(address));
        }
    }

    /// Remove and return the recorded size. Fatal if `address` was
    /// never granted: freeing foreign memory means the caller's
    /// bookkeeping is gone and ours can no longer be trusted.
    fn remove(&mut self, address: usize) -> usize {
        self.blocks
            .remove(&address)
            .unwrap_or_else(|| die!("ExternalIndex::remove", Fault::InvalidFree(address)))
    }

    fn get(&self, address: usize) -> Option<usize> {
        self.blocks.get(&address).copied()
    }

    fn total_bytes(&self) -> usize {
        self.blocks.values().sum()
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// The token-based pool memory manager.
pub struct Tbman {
    /// Block managers in strictly increasing block-size order.
    classes: Vec<BlockManager>,
    /// Copy of each class's block size, scanned to classify requests.
    block_sizes: Vec<usize>,
    pool_size: usize,
    /// Largest block class; requests above it go external. Clamped to
    /// the last generated ladder rung so hinted frees can trust
    /// `size <= max_block_size` to mean "pool-managed".
    max_block_size: usize,
    /// True while every pool is aligned to `pool_size`. Monotone: once
    /// lost, the masking fast path stays disabled.
    aligned: bool,
    pool_index: PoolIndex,
    external: ExternalIndex,
}

// SAFETY: the raw pool pointers all reference memory exclusively owned
// by this manager, so sending the manager sends sole access with it.
unsafe impl Send for Tbman {}

impl Tbman {
    /// Build a manager from `config`. Fatal on invalid configuration.
    pub fn new(config: &TbmanConfig) -> Self {
        if !config.pool_size.is_power_of_two() {
            die!("Tbman::new", Fault::PoolSizeNotPowerOfTwo(config.pool_size));
        }
        if config.min_block_size == 0 {
            die!("Tbman::new", Fault::ZeroMinBlockSize);
        }
        if config.pool_size / config.min_block_size > pool::MAX_BLOCKS_PER_POOL {
            die!("Tbman::new", Fault::TooManyBlocks(config.pool_size / config.min_block_size));
        }

        let block_sizes =
            ladder::block_sizes(config.min_block_size, config.max_block_size, config.stepping_method);
        let largest = *block_sizes.last().unwrap_or_else(|| {
            die!("Tbman::new", Fault::PoolTooSmall(config.pool_size, config.min_block_size))
        });
        // Every class must leave at least one grantable block per pool;
        // the largest class is the binding case.
        if config.pool_size / largest < pool::reserved_blocks(config.pool_size, largest) + 1 {
            die!("Tbman::new", Fault::PoolTooSmall(config.pool_size, largest));
        }

        let classes = block_sizes
            .iter()
            .enumerate()
            .map(|(i, &block_size)| {
                BlockManager::new(config.pool_size, block_size, config.full_align, i as u32)
            })
            .collect();

        Self {
            classes,
            block_sizes,
            pool_size: config.pool_size,
            max_block_size: largest,
            aligned: true,
            pool_index: PoolIndex::new(),
            external: ExternalIndex::new(),
        }
    }

    /// Service a fresh request: the smallest fitting block class, or
    /// the platform for oversize requests.
    pub(crate) fn mem_alloc(&mut self, requested_size: usize) -> Grant {
        debug_assert!(requested_size != 0);

        for (i, &block_size) in self.block_sizes.iter().enumerate() {
            if requested_size <= block_size {
                let class = &mut self.classes[i];
                let ptr = class.alloc(&mut self.pool_index);
                self.aligned &= class.aligned;
                return Grant { ptr, size: block_size };
            }
        }

        // Oversize: platform-serviced, tracked by address.
        let ptr = platform::aligned_alloc(requested_size, TBMAN_ALIGN);
        if ptr.is_null() {
            die!("Tbman::mem_alloc", Fault::OutOfMemory(requested_size));
        }
        self.external.register(ptr as usize, requested_size);
        trace_log!(address = ptr as usize, requested_size, "external block granted");
        Grant { ptr, size: requested_size }
    }

    /// Resolve the pool owning `ptr`: by masking when the caller's size
    /// hint proves the block is pool-managed and every pool is aligned,
    /// by the pool-address tree otherwise. `None` means external.
    fn owning_pool(&self, ptr: *mut u8, size_hint: Option<usize>) -> Option<NonNull<TokenManager>> {
        if let Some(hint) = size_hint {
            if hint <= self.max_block_size && self.aligned {
                let base = ptr as usize & !(self.pool_size - 1);
                // SAFETY: an aligned manager only ever granted
                // pool-managed blocks for sizes within the ladder, so
                // the masked base is a live pool header.
                return Some(unsafe { NonNull::new_unchecked(base as *mut TokenManager) });
            }
        }
        self.pool_index.owner_of(ptr as usize, self.pool_size)
    }

    /// Free `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live block granted by this manager, and
    /// `size_hint`, when given, a size this manager granted at most
    /// `max_block_size` only if the block is pool-managed.
    pub(crate) unsafe fn mem_free(&mut self, ptr: *mut u8, size_hint: Option<usize>) {
        match self.owning_pool(ptr, size_hint) {
            Some(tm) => {
                // SAFETY: tm is the live pool owning ptr; class_index
                // addresses the block manager that created it.
                unsafe {
                    let class = (*tm.as_ptr()).class_index as usize;
                    self.classes[class].free(tm, ptr, &mut self.pool_index);
                }
            }
            None => {
                let size = self.external.remove(ptr as usize);
                trace_log!(address = ptr as usize, size, "external block released");
                // SAFETY: external blocks are allocated with their
                // recorded size at TBMAN_ALIGN.
                unsafe { platform::aligned_free(ptr, size, TBMAN_ALIGN) };
            }
        }
    }

    /// Resize `current_ptr` to `requested_size`, in place where the
    /// class allows it, relocating otherwise.
    ///
    /// # Safety
    /// As [`Self::mem_free`].
    pub(crate) unsafe fn mem_realloc(
        &mut self,
        current_ptr: *mut u8,
        size_hint: Option<usize>,
        requested_size: usize,
    ) -> Grant {
        if let Some(tm) = self.owning_pool(current_ptr, size_hint) {
            // SAFETY: tm is live.
            let block_size = unsafe { (*tm.as_ptr()).block_size };

            if requested_size > block_size {
                // Growth out of this class: fresh allocation, move the
                // whole old block.
                let grant = self.mem_alloc(requested_size);
                // SAFETY: both blocks are live and disjoint; the new
                // grant holds at least block_size bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(current_ptr, grant.ptr, block_size);
                    let class = (*tm.as_ptr()).class_index as usize;
                    self.classes[class].free(tm, current_ptr, &mut self.pool_index);
                }
                return grant;
            }

            // Size reduction: relocate only when a smaller class fits.
            let target = self.block_sizes.iter().position(|&b| requested_size <= b);
            match target {
                Some(i) if self.block_sizes[i] != block_size => {
                    let class = &mut self.classes[i];
                    let new_ptr = class.alloc(&mut self.pool_index);
                    self.aligned &= class.aligned;
                    let granted = self.block_sizes[i];
                    // SAFETY: as above; requested_size fits both blocks.
                    unsafe {
                        std::ptr::copy_nonoverlapping(current_ptr, new_ptr, requested_size);
                        let old_class = (*tm.as_ptr()).class_index as usize;
                        self.classes[old_class].free(tm, current_ptr, &mut self.pool_index);
                    }
                    Grant { ptr: new_ptr, size: granted }
                }
                // Same class: keep the block where it is.
                _ => Grant { ptr: current_ptr, size: block_size },
            }
        } else if requested_size <= self.max_block_size {
            // Shrinks back under the class ceiling: bring it in-pool.
            let grant = self.mem_alloc(requested_size);
            let old_size = self.external.remove(current_ptr as usize);
            // SAFETY: the external block holds more than
            // max_block_size >= requested_size bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(current_ptr, grant.ptr, requested_size);
                platform::aligned_free(current_ptr, old_size, TBMAN_ALIGN);
            }
            grant
        } else {
            let current_bytes = self.external.get(current_ptr as usize).unwrap_or_else(|| {
                die!("Tbman::mem_realloc", Fault::UnknownExternal(current_ptr as usize))
            });

            // A mild shrink keeps the block in place; only below half
            // the granted size is relocation worth it.
            if requested_size < current_bytes && requested_size >= current_bytes >> 1 {
                return Grant { ptr: current_ptr, size: current_bytes };
            }

            let new_ptr = platform::aligned_alloc(requested_size, TBMAN_ALIGN);
            if new_ptr.is_null() {
                die!("Tbman::mem_realloc", Fault::OutOfMemory(requested_size));
            }
            self.external.register(new_ptr as usize, requested_size);
            let copy_bytes = requested_size.min(current_bytes);
            // SAFETY: both external blocks are live and disjoint;
            // copy_bytes fits the smaller of the two.
            unsafe {
                std::ptr::copy_nonoverlapping(current_ptr, new_ptr, copy_bytes);
            }
            self.external.remove(current_ptr as usize);
            // SAFETY: the old block's recorded size and alignment.
            unsafe { platform::aligned_free(current_ptr, current_bytes, TBMAN_ALIGN) };
            Grant { ptr: new_ptr, size: requested_size }
        }
    }

    /// Unified malloc/realloc/free.
    ///
    /// - `requested_size == 0`: frees `current_ptr` if non-null and
    ///   returns [`Grant::NONE`].
    /// - `current_ptr.is_null()`: fresh allocation.
    /// - Otherwise: reallocation, preserving contents up to the smaller
    ///   of the old granted and new requested size.
    ///
    /// # Safety
    /// `current_ptr` must be null or a live block granted by this
    /// manager and not freed since.
    pub unsafe fn alloc(&mut self, current_ptr: *mut u8, requested_size: usize) -> Grant {
        if requested_size == 0 {
            if !current_ptr.is_null() {
                // SAFETY: per contract.
                unsafe { self.mem_free(current_ptr, None) };
            }
            Grant::NONE
        } else if current_ptr.is_null() {
            self.mem_alloc(requested_size)
        } else {
            // SAFETY: per contract.
            unsafe { self.mem_realloc(current_ptr, None, requested_size) }
        }
    }

    /// [`Self::alloc`] with a size hint enabling the masking fast path.
    ///
    /// `current_size == 0` declares that `current_ptr` must not be used
    /// for free or realloc, turning the call into a fresh allocation
    /// (or a no-op for `requested_size == 0`).
    ///
    /// # Safety
    /// `current_size` must be zero or a size this manager granted for
    /// `current_ptr`, with `current_ptr` live and not freed since.
    pub unsafe fn nalloc(
        &mut self,
        current_ptr: *mut u8,
        current_size: usize,
        requested_size: usize,
    ) -> Grant {
        if requested_size == 0 {
            if current_size != 0 {
                // SAFETY: per contract.
                unsafe { self.mem_free(current_ptr, Some(current_size)) };
            }
            Grant::NONE
        } else if current_size == 0 {
            self.mem_alloc(requested_size)
        } else {
            // SAFETY: per contract.
            unsafe { self.mem_realloc(current_ptr, Some(current_size), requested_size) }
        }
    }

    /// Allocation honoring an explicit alignment, for the
    /// [`Allocator`](allocator_api2::alloc::Allocator) surface.
    ///
    /// Picks the smallest class whose block size fits the request and
    /// is a multiple of the alignment (block addresses are block-size
    /// multiples within a pool aligned at least to [`TBMAN_ALIGN`]);
    /// falls back to the external path otherwise. Alignments above
    /// [`TBMAN_ALIGN`] are not serviceable.
    pub(crate) fn alloc_layout(&mut self, size: usize, align: usize) -> Option<Grant> {
        debug_assert!(size != 0);
        if align > TBMAN_ALIGN {
            return None;
        }
        for (i, &block_size) in self.block_sizes.iter().enumerate() {
            if block_size >= size && block_size % align == 0 {
                let class = &mut self.classes[i];
                let ptr = class.alloc(&mut self.pool_index);
                self.aligned &= class.aligned;
                return Some(Grant { ptr, size: block_size });
            }
        }
        Some(self.external_alloc_for_layout(size))
    }

    fn external_alloc_for_layout(&mut self, size: usize) -> Grant {
        let ptr = platform::aligned_alloc(size, TBMAN_ALIGN);
        if ptr.is_null() {
            die!("Tbman::external_alloc_for_layout", Fault::OutOfMemory(size));
        }
        self.external.register(ptr as usize, size);
        Grant { ptr, size }
    }

    /// Usable bytes behind `ptr`: its class's block size for
    /// pool-managed blocks, the recorded size for external blocks, 0
    /// for pointers this manager never granted.
    pub fn granted_space(&self, ptr: *const u8) -> usize {
        if let Some(tm) = self.pool_index.owner_of(ptr as usize, self.pool_size) {
            // SAFETY: tm is live.
            unsafe { (*tm.as_ptr()).block_size }
        } else {
            self.external.get(ptr as usize).unwrap_or(0)
        }
    }

    fn internal_granted_bytes(&self) -> usize {
        self.classes.iter().map(BlockManager::granted_bytes).sum()
    }

    fn internal_live_blocks(&self) -> usize {
        self.classes.iter().map(BlockManager::live_blocks).sum()
    }

    /// Sum of granted bytes over every live block, internal and external.
    pub fn total_granted_space(&self) -> usize {
        self.internal_granted_bytes() + self.external.total_bytes()
    }

    /// Number of live blocks, internal and external.
    pub fn total_instances(&self) -> usize {
        self.internal_live_blocks() + self.external.len()
    }

    /// Snapshot every live block as `(address, granted_size)`, external
    /// blocks first. The caller iterates the snapshot outside any lock.
    pub fn collect_instances(&self) -> Vec<(*mut u8, usize)> {
        let mut instances = Vec::with_capacity(self.total_instances());
        for (&address, &size) in &self.external.blocks {
            instances.push((address as *mut u8, size));
        }
        for class in &self.classes {
            class.for_each_live(&mut |ptr, size| instances.push((ptr, size)));
        }
        instances
    }

    /// A point-in-time summary of the manager's shape and load.
    pub fn status(&self) -> Status {
        Status {
            pool_size: self.pool_size,
            block_classes: self.classes.len(),
            pools: self.pool_index.len(),
            external_blocks: self.external.len(),
            aligned: self.aligned,
            min_block_size: self.block_sizes.first().copied().unwrap_or(0),
            max_block_size: self.max_block_size,
            internal_granted_bytes: self.internal_granted_bytes(),
            external_granted_bytes: self.external.total_bytes(),
            pool_footprint_bytes: self.classes.iter().map(BlockManager::footprint).sum(),
        }
    }

    /// The shutdown warning line for the current leak state, or `None`
    /// when every granted block has been returned.
    fn leak_report(&self) -> Option<String> {
        let leaked_bytes = self.total_granted_space();
        if leaked_bytes == 0 {
            return None;
        }
        let leaked_instances = self.total_instances();
        Some(format!(
            "TBMAN WARNING: Detected {leaked_instances} instances with a total of \
             {leaked_bytes} bytes leaking space."
        ))
    }

    /// Assert every documented invariant of the whole hierarchy.
    /// Compiled for tests and the `error-scanning` feature only.
    #[cfg(any(test, feature = "error-scanning"))]
    pub fn scan_for_errors(&self) {
        assert!(self.block_sizes.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(self.block_sizes.len(), self.classes.len());

        let mut all_aligned = true;
        let mut pool_count = 0;
        for (i, class) in self.classes.iter().enumerate() {
            assert_eq!(class.block_size, self.block_sizes[i]);
            class.scan_for_errors();
            all_aligned &= class.aligned;
            pool_count += class.pool_count();
        }
        assert_eq!(self.aligned, all_aligned, "alignment latch out of sync");
        assert_eq!(self.pool_index.len(), pool_count, "pool index out of sync");

        let accounted: usize = self.classes.iter().map(BlockManager::granted_bytes).sum();
        assert_eq!(accounted + self.external.total_bytes(), self.total_granted_space());
    }
}

impl Default for Tbman {
    fn default() -> Self {
        Self::new(&TbmanConfig::default())
    }
}

impl Drop for Tbman {
    fn drop(&mut self) {
        if let Some(report) = self.leak_report() {
            crate::trace::warn_log!(
                leaked_instances = self.total_instances(),
                leaked_bytes = self.total_granted_space(),
                "shutting down with leaks"
            );
            eprintln!("{report}");
        }
    }
}

/// Point-in-time summary returned by [`Tbman::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Size of every pool in bytes.
    pub pool_size: usize,
    /// Number of block-size classes.
    pub block_classes: usize,
    /// Number of live pools across all classes.
    pub pools: usize,
    /// Number of live external blocks.
    pub external_blocks: usize,
    /// Whether the masking fast path is still available.
    pub aligned: bool,
    /// Smallest block class.
    pub min_block_size: usize,
    /// Largest block class.
    pub max_block_size: usize,
    /// Bytes granted out of pools.
    pub internal_granted_bytes: usize,
    /// Bytes granted externally.
    pub external_granted_bytes: usize,
    /// Total pool bytes held from the platform.
    pub pool_footprint_bytes: usize,
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"pool_size:              {}
block classes:          {}
pools:                  {}
external blocks:        {}
aligned:                {}
min_block_size:         {}
max_block_size:         {}
total internal granted: {}
total external granted: {}
total pool footprint:   {}"#,
            self.pool_size,
            self.block_classes,
            self.pools,
            self.external_blocks,
            self.aligned,
            self.min_block_size,
            self.max_block_size,
            self.internal_granted_bytes,
            self.external_granted_bytes,
            self.pool_footprint_bytes,
        )
    }
}
