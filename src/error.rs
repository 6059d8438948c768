//! Fatal fault handling.
//!
//! Every fault the manager can detect — bad configuration, platform
//! exhaustion, index corruption, frees of foreign pointers — leaves it
//! unable to guarantee the integrity of memory it has already handed
//! out. There is no recoverable error channel: a fault is reported on
//! stderr and the process is aborted.

use std::panic::Location;

/// The unrecoverable fault kinds the manager distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// `pool_size` must be a power of two for the owner-masking trick.
    #[error("pool_size {0} is not a power of two")]
    PoolSizeNotPowerOfTwo(usize),
    /// Tokens are 16-bit block indices; a pool may not hold more than 65536 blocks.
    #[error("{0} blocks per pool exceeds the token limit of 65536")]
    TooManyBlocks(usize),
    /// The pool must fit its own header, the token stack and at least one free block.
    #[error("pool_size {0} is too small for block_size {1}")]
    PoolTooSmall(usize, usize),
    /// `stepping_method` of zero never terminates the ladder mask search;
    /// values at or above the word width overflow it.
    #[error("stepping_method {0} is out of range")]
    BadStepping(usize),
    /// Block classes need a nonzero lower bound.
    #[error("min_block_size must be nonzero")]
    ZeroMinBlockSize,
    /// The platform allocator returned null.
    #[error("failed allocating {0} bytes")]
    OutOfMemory(usize),
    /// A pool base address was already registered.
    #[error("failed registering pool address {0:#x}")]
    PoolRegistration(usize),
    /// A pool base address to deregister was not present.
    #[error("failed removing pool address {0:#x}")]
    PoolDeregistration(usize),
    /// An external block address was already registered.
    #[error("failed registering external address {0:#x}")]
    ExternalRegistration(usize),
    /// A freed pointer was not issued by this manager.
    #[error("attempt to free invalid memory at {0:#x}")]
    InvalidFree(usize),
    /// An external block had no recorded size.
    #[error("no external size recorded for {0:#x}")]
    UnknownExternal(usize),
    /// A veneer entry point ran without an open process-wide manager.
    #[error("manager is not open; call tbman::open() at the beginning of your program")]
    NotOpen,
}

/// Report `fault` and abort the process, naming the function that hit it.
///
/// `$function` is the bare function name (qualify methods with their
/// type, e.g. `"PoolIndex::register"`); the module path is prepended so
/// the report reads like `tbman::pool::create`.
macro_rules! die {
    ($function:literal, $fault:expr) => {
        $crate::error::abort_with(concat!(module_path!(), "::", $function), $fault)
    };
}
pub(crate) use die;

/// Print the fault report and abort.
///
/// The message goes straight to stderr rather than through the tracing
/// layer: the process is about to die and the report must not depend on
/// subscriber state (or allocate through the manager being reported on).
#[track_caller]
#[cold]
pub(crate) fn abort_with(function: &'static str, fault: Fault) -> ! {
    let location = Location::caller();
    eprintln!("tbman: error in function {function} ({location}): {fault}");
    std::process::abort()
}
