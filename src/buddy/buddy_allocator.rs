//! Buddy-system region allocator
//!
//! Wraps a [`BuddySet`] with the instance lock and diagnostics, and exposes
//! it through the shared [`RegionAllocator`] contract.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::warn;

use super::buddy_block::{class_size, MIN_SIZE_CLASS};
#[cfg(feature = "tracking")]
use super::buddy_block::NUM_CLASSES;
use super::buddy_set::BuddySet;
use crate::diagnostics::{DiagnosticSink, Diagnostics};
use crate::fit::FitMode;
use crate::upstream::UpstreamAllocator;
use crate::{AllocError, AllocResult, BlockInfo, RegionAllocator};

/// Smallest arena: one block of the minimum class.
pub const MIN_ARENA_SIZE: usize = class_size(MIN_SIZE_CLASS);

/// Region allocator handing out power-of-two blocks.
///
/// The arena size is the requested size rounded up to a power of two. Every
/// block, header included, spans `2^class` bytes and sits at an offset that
/// is a multiple of its size.
pub struct BuddyAllocator {
    inner: SpinNoIrq<BuddySet>,
    diag: Diagnostics,
}

impl BuddyAllocator {
    /// Create an allocator over an arena of `size.next_power_of_two()` bytes.
    ///
    /// The arena comes from `upstream`, or from the global heap when none is
    /// given.
    pub fn new(
        size: usize,
        upstream: Option<Arc<dyn UpstreamAllocator>>,
        sink: Option<Arc<dyn DiagnosticSink>>,
        fit_mode: FitMode,
    ) -> AllocResult<Self> {
        let diag = Diagnostics::new(sink);
        let capacity = size
            .checked_next_power_of_two()
            .filter(|&capacity| size > 0 && capacity >= MIN_ARENA_SIZE);
        let Some(capacity) = capacity else {
            diag.error(format_args!(
                "buddy system: {} bytes cannot hold the arena (minimum {})",
                size, MIN_ARENA_SIZE
            ));
            return Err(AllocError::InvalidParam);
        };

        let set = BuddySet::new(capacity, upstream, fit_mode)?;
        diag.debug(format_args!(
            "buddy system: arena of {} bytes ready, top class {} ({})",
            capacity,
            set.top_class(),
            fit_mode
        ));
        Ok(Self {
            inner: SpinNoIrq::new(set),
            diag,
        })
    }

    /// Allocate a block able to hold `size` bytes.
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.inner.lock().allocate(size, &self.diag)
    }

    /// Free a block and merge it with its free buddies.
    pub fn deallocate(&self, ptr: *mut u8) -> AllocResult {
        self.inner.lock().deallocate(ptr, &self.diag)
    }

    pub fn set_fit_mode(&self, mode: FitMode) {
        self.inner.lock().arena_mut().set_fit_mode(mode);
        self.diag
            .debug(format_args!("buddy system: fit mode set to {}", mode));
    }

    pub fn fit_mode(&self) -> FitMode {
        self.inner.lock().arena().fit_mode()
    }

    pub fn list_blocks(&self) -> Vec<BlockInfo> {
        self.inner.lock().list_blocks()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().arena().data_len()
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> crate::stats::ArenaStats {
        crate::stats::ArenaStats::from_blocks(&self.list_blocks())
    }

    /// Free-list length per size class, indexed by class.
    #[cfg(feature = "tracking")]
    pub fn free_blocks_by_class(&self) -> [usize; NUM_CLASSES] {
        self.inner.lock().free_blocks_by_class()
    }
}

impl RegionAllocator for BuddyAllocator {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        Self::allocate(self, size)
    }

    fn deallocate(&self, ptr: *mut u8) -> AllocResult {
        Self::deallocate(self, ptr)
    }

    fn set_fit_mode(&self, mode: FitMode) {
        Self::set_fit_mode(self, mode)
    }

    fn fit_mode(&self) -> FitMode {
        Self::fit_mode(self)
    }

    fn list_blocks(&self) -> Vec<BlockInfo> {
        Self::list_blocks(self)
    }

    fn total_bytes(&self) -> usize {
        Self::total_bytes(self)
    }
}

impl UpstreamAllocator for BuddyAllocator {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        Self::allocate(self, size)
    }

    fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        if let Err(_e) = Self::deallocate(self, ptr.as_ptr()) {
            warn!(
                "buddy system: release of nested region {:#x} failed: {}",
                ptr.as_ptr() as usize,
                _e
            );
        }
    }
}
