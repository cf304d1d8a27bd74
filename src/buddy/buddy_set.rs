//! Buddy system core over one arena
//!
//! Implements split-on-allocate and merge-on-free using address-sorted
//! free lists, one per size class.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use super::buddy_block::{
    class_for, class_size, owner_tag, BuddyHeader, BLOCK_HEADER_SIZE, MIN_SIZE_CLASS,
    NUM_CLASSES,
};
use super::free_list::FreeList;
use crate::arena::{Arena, META_ANCHOR};
use crate::diagnostics::Diagnostics;
use crate::fit::FitMode;
use crate::upstream::UpstreamAllocator;
use crate::{AllocError, AllocResult, BlockInfo};

const META_TOP_CLASS: usize = META_ANCHOR;
const META_FREE_HEADS: usize = META_ANCHOR + 1;
const META_WORDS: usize = META_FREE_HEADS + NUM_CLASSES;

/// Buddy arena: the owned region plus its free lists.
///
/// Not synchronized; the caller serializes access.
pub(crate) struct BuddySet {
    arena: Arena,
}

impl BuddySet {
    /// Acquire a region of `capacity` bytes (a power of two) holding a single
    /// free block of the top class.
    pub fn new(
        capacity: usize,
        upstream: Option<Arc<dyn UpstreamAllocator>>,
        fit_mode: FitMode,
    ) -> AllocResult<Self> {
        debug_assert!(capacity.is_power_of_two());
        let top = capacity.trailing_zeros() as usize;
        debug_assert!(top >= MIN_SIZE_CLASS);

        let mut arena = Arena::acquire(capacity, META_WORDS, upstream, fit_mode)?;
        arena.set_meta(META_TOP_CLASS, top);
        let mut set = Self { arena };
        for class in 0..NUM_CLASSES {
            set.free_list(class).clear(&mut set.arena);
        }

        let owner = set.arena.owner();
        BuddyHeader::new(top, false, owner).write(&mut set.arena, 0);
        set.free_list(top).insert_sorted(&mut set.arena, 0);
        Ok(set)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn top_class(&self) -> usize {
        self.arena.meta(META_TOP_CLASS)
    }

    fn free_list(&self, class: usize) -> FreeList {
        debug_assert!(class < NUM_CLASSES);
        FreeList::new(class, META_FREE_HEADS + class)
    }

    fn header(&self, offset: usize) -> BuddyHeader {
        BuddyHeader::read(&self.arena, offset)
    }

    fn owned(&self, header: &BuddyHeader) -> bool {
        header.owner == owner_tag(self.arena.owner())
    }

    /// Checks that a block starts at `offset` by descending from the top
    /// block through the halves containing it.
    ///
    /// Every visited base is the start of a real block, so header-shaped
    /// client data inside a payload is never consulted.
    fn is_block_start(&self, offset: usize) -> bool {
        let mut class = self.top_class();
        let mut base = 0;
        loop {
            let block = self.header(base);
            if block.class >= class {
                return base == offset;
            }
            if class <= MIN_SIZE_CLASS {
                return false;
            }
            class -= 1;
            base += offset & class_size(class);
        }
    }

    /// Free blocks of classes `>= class` as `(offset, size)`, ascending by
    /// class then by address.
    fn candidates(&self, class: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (class..=self.top_class()).flat_map(move |c| {
            self.free_list(c)
                .iter(&self.arena)
                .map(move |offset| (offset, class_size(c)))
        })
    }

    /// Halve the free block at `offset` down to `class`, returning the upper
    /// halves to their free lists.
    fn split_down(&mut self, offset: usize, from: usize, class: usize, diag: &Diagnostics) {
        let owner = self.arena.owner();
        let mut current = from;
        while current > class {
            current -= 1;
            let upper = offset + class_size(current);
            BuddyHeader::new(current, false, owner).write(&mut self.arena, upper);
            self.free_list(current).insert_sorted(&mut self.arena, upper);
            diag.debug(format_args!(
                "buddy system: split block at {:#x} into two of {} bytes",
                offset,
                class_size(current)
            ));
        }
    }

    pub fn allocate(&mut self, size: usize, diag: &Diagnostics) -> AllocResult<NonNull<u8>> {
        diag.debug(format_args!("buddy system: allocating {} bytes", size));
        if size == 0 {
            diag.warning(format_args!("buddy system: zero-sized allocation rejected"));
            return Err(AllocError::InvalidParam);
        }

        let mode = self.arena.fit_mode();
        let class = class_for(size).filter(|&class| class <= self.top_class());
        let found = class.and_then(|class| mode.select(self.candidates(class), class_size(class)));
        let (Some(class), Some(offset)) = (class, found) else {
            diag.error(format_args!(
                "buddy system: unable to allocate {} bytes ({})",
                size, mode
            ));
            #[cfg(feature = "tracking")]
            self.report_failure(size, diag);
            return Err(AllocError::NoMemory);
        };

        let block = self.header(offset);
        diag.trace(format_args!(
            "buddy system: found block at {:#x} of {} bytes",
            offset,
            block.size()
        ));
        self.free_list(block.class).remove(&mut self.arena, offset);
        self.split_down(offset, block.class, class, diag);

        let owner = self.arena.owner();
        BuddyHeader::new(class, true, owner).write(&mut self.arena, offset);

        let ptr = self.arena.ptr_at(offset + BLOCK_HEADER_SIZE);
        diag.debug(format_args!(
            "buddy system: allocated {} bytes at {:#x}",
            class_size(class),
            ptr.as_ptr() as usize
        ));
        Ok(ptr)
    }

    pub fn deallocate(&mut self, ptr: *mut u8, diag: &Diagnostics) -> AllocResult {
        if ptr.is_null() {
            return Ok(());
        }
        diag.debug(format_args!("buddy system: freeing block at {:#x}", ptr as usize));

        let offset = self
            .arena
            .offset_of(ptr)
            .and_then(|data_offset| data_offset.checked_sub(BLOCK_HEADER_SIZE))
            .filter(|&offset| offset % class_size(MIN_SIZE_CLASS) == 0);
        let Some(offset) = offset else {
            diag.error(format_args!(
                "buddy system: pointer {:#x} does not belong to the arena",
                ptr as usize
            ));
            return Err(AllocError::InvalidPointer);
        };

        let block = self.header(offset);
        let well_formed = block.class >= MIN_SIZE_CLASS
            && block.class <= self.top_class()
            && offset % block.size() == 0;
        if !block.occupied
            || !self.owned(&block)
            || !well_formed
            || !self.is_block_start(offset)
        {
            diag.error(format_args!(
                "buddy system: double free or foreign block at {:#x}",
                ptr as usize
            ));
            return Err(AllocError::NotAllocated);
        }

        let mut offset = offset;
        let mut class = block.class;
        let top = self.top_class();
        while class < top {
            let buddy = offset ^ class_size(class);
            let buddy_block = self.header(buddy);
            if buddy_block.occupied || !self.owned(&buddy_block) || buddy_block.class != class {
                break;
            }

            self.free_list(class).remove(&mut self.arena, buddy);
            let (lower, upper) = if buddy < offset {
                (buddy, offset)
            } else {
                (offset, buddy)
            };
            BuddyHeader::clear(&mut self.arena, upper);
            diag.debug(format_args!(
                "buddy system: merged buddies {:#x} and {:#x} into {} bytes",
                lower,
                upper,
                class_size(class + 1)
            ));
            offset = lower;
            class += 1;
        }

        let owner = self.arena.owner();
        BuddyHeader::new(class, false, owner).write(&mut self.arena, offset);
        self.free_list(class).insert_sorted(&mut self.arena, offset);
        diag.debug(format_args!(
            "buddy system: freed block at {:#x} as {} bytes",
            offset,
            class_size(class)
        ));
        Ok(())
    }

    /// Step through the arena block by block.
    pub fn list_blocks(&self) -> Vec<BlockInfo> {
        let data_len = self.arena.data_len();
        let top = self.top_class();
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < data_len {
            let block = self.header(offset);
            assert!(
                block.class >= MIN_SIZE_CLASS
                    && block.class <= top
                    && offset % block.size() == 0
                    && self.owned(&block),
                "buddy system: corrupted header at {:#x}: {:?}",
                offset,
                block
            );
            blocks.push(BlockInfo::new(block.size(), block.occupied));
            offset += block.size();
        }
        blocks
    }

    /// Number of free blocks per size class.
    #[cfg(feature = "tracking")]
    pub fn free_blocks_by_class(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for (class, count) in counts.iter_mut().enumerate().take(self.top_class() + 1) {
            *count = self.free_list(class).len(&self.arena);
        }
        counts
    }

    #[cfg(feature = "tracking")]
    fn report_failure(&self, size: usize, diag: &Diagnostics) {
        crate::stats::report_alloc_failure(diag, "buddy system", size, &self.list_blocks());
        diag.error(format_args!("  Free blocks by class:"));
        let counts = self.free_blocks_by_class();
        for class in (MIN_SIZE_CLASS..=self.top_class()).rev() {
            if counts[class] > 0 {
                diag.error(format_args!(
                    "    Class {}: {} blocks ({} bytes each)",
                    class,
                    counts[class],
                    class_size(class)
                ));
            }
        }
    }
}
