//! Region allocators
//!
//! This crate carves one contiguous arena out of an upstream allocator (or the
//! process heap) and manages it with one of two block strategies:
//! - Boundary-tag allocator: address-ordered doubly linked blocks with
//!   coalescing of adjacent free neighbours
//! - Buddy-system allocator: power-of-two blocks with per-size-class free lists
//!   and buddy merging
//!
//! Both engines share the [`FitMode`] placement policy, the [`RegionAllocator`]
//! contract and the [`DiagnosticSink`] collaborator.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Natural word size; every block header and payload is a multiple of it.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` (zero, or too small to hold the arena metadata).
    InvalidParam,
    /// No free block can satisfy the request.
    NoMemory,
    /// Deallocate a block that is not currently allocated by this arena
    /// (double free or foreign block).
    NotAllocated,
    /// Deallocate a pointer that lies outside the arena.
    InvalidPointer,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidParam => f.write_str("invalid allocation parameter"),
            AllocError::NoMemory => f.write_str("out of memory"),
            AllocError::NotAllocated => f.write_str("block is not allocated by this arena"),
            AllocError::InvalidPointer => f.write_str("pointer does not belong to the arena"),
        }
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// One entry of an arena walk: the full block extent (header included) and
/// whether the block is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub size: usize,
    pub occupied: bool,
}

impl BlockInfo {
    pub const fn new(size: usize, occupied: bool) -> Self {
        Self { size, occupied }
    }
}

/// The contract shared by every region allocator.
pub trait RegionAllocator {
    /// Allocate a block able to hold `size` bytes.
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>>;

    /// Return a block previously handed out by [`RegionAllocator::allocate`].
    ///
    /// A null pointer is accepted and ignored.
    fn deallocate(&self, ptr: *mut u8) -> AllocResult;

    /// Switch the placement policy for subsequent allocations.
    fn set_fit_mode(&self, mode: FitMode);

    /// Returns the active placement policy.
    fn fit_mode(&self) -> FitMode;

    /// Walk the arena in address order.
    fn list_blocks(&self) -> Vec<BlockInfo>;

    /// Returns the usable arena size in bytes.
    fn total_bytes(&self) -> usize;
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

mod arena;

pub mod diagnostics;
pub use diagnostics::{DiagnosticSink, Severity};

pub mod fit;
pub use fit::FitMode;

pub mod upstream;
pub use upstream::{GlobalHeap, UpstreamAllocator};

pub mod boundary;
pub use boundary::BoundaryTagAllocator;

pub mod buddy;
pub use buddy::BuddyAllocator;

#[cfg(feature = "tracking")]
pub mod stats;
#[cfg(feature = "tracking")]
pub use stats::ArenaStats;
