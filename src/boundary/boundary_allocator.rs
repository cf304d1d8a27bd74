//! Boundary-tag allocator
//!
//! Keeps every block of the arena, free or allocated, in one address-ordered
//! doubly linked list. Allocation splits the selected block when the
//! remainder can hold a header plus payload; deallocation coalesces the block
//! with free physical neighbours.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::warn;

use super::block::{BlockHeader, BLOCK_HEADER_SIZE, MAX_PAYLOAD};
use crate::arena::{Arena, META_ANCHOR};
use crate::diagnostics::{DiagnosticSink, Diagnostics};
use crate::fit::FitMode;
use crate::upstream::UpstreamAllocator;
use crate::{align_up, is_aligned, AllocError, AllocResult, BlockInfo, RegionAllocator, WORD_SIZE};

/// Meta word anchoring the block list.
const META_FIRST_BLOCK: usize = META_ANCHOR;
const META_WORDS: usize = META_ANCHOR + 1;

/// Smallest arena: one header plus one word of payload.
pub const MIN_ARENA_SIZE: usize = BLOCK_HEADER_SIZE + WORD_SIZE;

/// Block list state, only ever touched under the allocator lock.
struct BoundaryTags {
    arena: Arena,
}

/// Walks the block list, checking that it tiles the arena.
struct BlockIter<'a> {
    tags: &'a BoundaryTags,
    current: Option<usize>,
    prev: Option<usize>,
    expected: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = (usize, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let data_len = self.tags.arena.data_len();
        let Some(offset) = self.current else {
            assert!(
                self.expected == data_len,
                "boundary tags: block list ends at {:#x}, arena ends at {:#x}",
                self.expected,
                data_len
            );
            return None;
        };

        assert!(
            offset == self.expected,
            "boundary tags: block at {:#x} does not follow previous block ending at {:#x}",
            offset,
            self.expected
        );
        let header = self.tags.header(offset);
        assert!(
            header.prev == self.prev && offset + header.extent() <= data_len,
            "boundary tags: corrupted header at {:#x}: {:?}",
            offset,
            header
        );

        self.prev = Some(offset);
        self.expected = offset + header.extent();
        self.current = header.next;
        Some((offset, header))
    }
}

impl BoundaryTags {
    fn header(&self, offset: usize) -> BlockHeader {
        BlockHeader::read(&self.arena, offset)
    }

    fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            tags: self,
            current: Some(self.arena.meta(META_FIRST_BLOCK)),
            prev: None,
            expected: 0,
        }
    }

    fn list_blocks(&self) -> Vec<BlockInfo> {
        self.blocks()
            .map(|(_, header)| BlockInfo::new(header.extent(), header.allocated))
            .collect()
    }

    fn find_fit(&self, payload: usize, mode: FitMode) -> Option<usize> {
        let free_blocks = self
            .blocks()
            .filter(|(_, header)| !header.allocated)
            .map(|(offset, header)| (offset, header.size));
        mode.select(free_blocks, payload)
    }

    /// Shrink the block at `offset` to `payload` bytes and turn the rest into
    /// a free block linked right after it.
    fn split(&mut self, offset: usize, payload: usize, diag: &Diagnostics) {
        let mut block = self.header(offset);
        debug_assert!(block.size > payload + BLOCK_HEADER_SIZE);

        let rest_offset = offset + BLOCK_HEADER_SIZE + payload;
        let rest = BlockHeader::free(
            block.size - payload - BLOCK_HEADER_SIZE,
            Some(offset),
            block.next,
            self.arena.owner(),
        );
        rest.write(&mut self.arena, rest_offset);

        if let Some(next) = block.next {
            let mut next_block = self.header(next);
            next_block.prev = Some(rest_offset);
            next_block.write(&mut self.arena, next);
        }

        block.size = payload;
        block.next = Some(rest_offset);
        block.write(&mut self.arena, offset);

        diag.debug(format_args!(
            "boundary tags: split block at {:#x} into {} and {} bytes",
            offset,
            block.extent(),
            rest.extent()
        ));
    }

    fn can_merge_next(&self, offset: usize) -> bool {
        let block = self.header(offset);
        let Some(next) = block.next else {
            return false;
        };
        !self.header(next).allocated && offset + block.extent() == next
    }

    fn can_merge_prev(&self, offset: usize) -> bool {
        let block = self.header(offset);
        let Some(prev) = block.prev else {
            return false;
        };
        let prev_block = self.header(prev);
        !prev_block.allocated && prev + prev_block.extent() == offset
    }

    /// Absorb `higher` into `lower`; `lower` survives as the merged block.
    fn merge(&mut self, lower: usize, higher: usize, diag: &Diagnostics) {
        debug_assert!(lower < higher);
        let mut acceptor = self.header(lower);
        let donor = self.header(higher);

        acceptor.size += donor.extent();
        acceptor.next = donor.next;
        acceptor.write(&mut self.arena, lower);

        if let Some(next) = donor.next {
            let mut next_block = self.header(next);
            next_block.prev = Some(lower);
            next_block.write(&mut self.arena, next);
        }
        BlockHeader::clear(&mut self.arena, higher);

        diag.debug(format_args!(
            "boundary tags: merged block {:#x} into {:#x}, now {} bytes",
            higher,
            lower,
            acceptor.extent()
        ));
    }

    fn allocate(&mut self, size: usize, diag: &Diagnostics) -> AllocResult<NonNull<u8>> {
        diag.debug(format_args!("boundary tags: allocating {} bytes", size));
        if size == 0 {
            diag.warning(format_args!("boundary tags: zero-sized allocation rejected"));
            return Err(AllocError::InvalidParam);
        }
        if size > MAX_PAYLOAD {
            diag.error(format_args!("boundary tags: unable to allocate {} bytes", size));
            return Err(AllocError::NoMemory);
        }

        let payload = align_up(size, WORD_SIZE);
        let mode = self.arena.fit_mode();
        let Some(offset) = self.find_fit(payload, mode) else {
            diag.error(format_args!(
                "boundary tags: unable to allocate {} bytes ({})",
                payload, mode
            ));
            #[cfg(feature = "tracking")]
            crate::stats::report_alloc_failure(diag, "boundary tags", size, &self.list_blocks());
            return Err(AllocError::NoMemory);
        };

        let found = self.header(offset);
        diag.trace(format_args!(
            "boundary tags: found block at {:#x} of {} bytes",
            offset, found.size
        ));
        if found.size - payload > BLOCK_HEADER_SIZE {
            self.split(offset, payload, diag);
        }

        let mut block = self.header(offset);
        block.allocated = true;
        block.owner = self.arena.owner();
        block.write(&mut self.arena, offset);

        let ptr = self.arena.ptr_at(offset + BLOCK_HEADER_SIZE);
        diag.debug(format_args!(
            "boundary tags: allocated {} bytes at {:#x}",
            block.size,
            ptr.as_ptr() as usize
        ));
        Ok(ptr)
    }

    /// Checks that `offset` is a block reachable through its neighbours.
    fn is_linked(&self, offset: usize, block: &BlockHeader) -> bool {
        let data_len = self.arena.data_len();
        let in_arena = |other: usize| {
            is_aligned(other, WORD_SIZE) && other <= data_len.saturating_sub(BLOCK_HEADER_SIZE)
        };

        let prev_ok = match block.prev {
            Some(prev) => {
                prev < offset && in_arena(prev) && self.header(prev).next == Some(offset)
            }
            None => offset == self.arena.meta(META_FIRST_BLOCK),
        };
        let next_ok = match block.next {
            Some(next) => {
                next > offset && in_arena(next) && self.header(next).prev == Some(offset)
            }
            None => offset.checked_add(block.extent()) == Some(data_len),
        };
        prev_ok && next_ok
    }

    fn deallocate(&mut self, ptr: *mut u8, diag: &Diagnostics) -> AllocResult {
        if ptr.is_null() {
            return Ok(());
        }
        diag.debug(format_args!(
            "boundary tags: freeing block at {:#x}",
            ptr as usize
        ));

        let offset = self
            .arena
            .offset_of(ptr)
            .filter(|&data_offset| is_aligned(data_offset, WORD_SIZE))
            .and_then(|data_offset| data_offset.checked_sub(BLOCK_HEADER_SIZE));
        let Some(offset) = offset else {
            diag.error(format_args!(
                "boundary tags: pointer {:#x} does not belong to the arena",
                ptr as usize
            ));
            return Err(AllocError::InvalidPointer);
        };

        let mut block = self.header(offset);
        if !block.allocated || block.owner != self.arena.owner() || !self.is_linked(offset, &block)
        {
            diag.error(format_args!(
                "boundary tags: double free or foreign block at {:#x}",
                ptr as usize
            ));
            return Err(AllocError::NotAllocated);
        }

        block.allocated = false;
        block.write(&mut self.arena, offset);

        // Next first, so the extent already covers the absorbed neighbour
        // when adjacency to the previous block is tested.
        if self.can_merge_next(offset) {
            if let Some(next) = block.next {
                self.merge(offset, next, diag);
            }
        }
        if self.can_merge_prev(offset) {
            if let Some(prev) = block.prev {
                self.merge(prev, offset, diag);
            }
        }

        diag.debug(format_args!("boundary tags: freed block at {:#x}", offset));
        Ok(())
    }
}

/// Region allocator over a single arena using boundary tags.
///
/// Every operation runs under one lock per instance.
pub struct BoundaryTagAllocator {
    inner: SpinNoIrq<BoundaryTags>,
    diag: Diagnostics,
}

impl BoundaryTagAllocator {
    /// Create an allocator managing `size` usable bytes (rounded up to a
    /// word).
    ///
    /// The arena comes from `upstream`, or from the global heap when none is
    /// given. Fails with [`AllocError::InvalidParam`] if `size` cannot hold a
    /// single block.
    pub fn new(
        size: usize,
        upstream: Option<Arc<dyn UpstreamAllocator>>,
        sink: Option<Arc<dyn DiagnosticSink>>,
        fit_mode: FitMode,
    ) -> AllocResult<Self> {
        let diag = Diagnostics::new(sink);
        if size < MIN_ARENA_SIZE || size > MAX_PAYLOAD {
            diag.error(format_args!(
                "boundary tags: {} bytes cannot hold the arena (minimum {})",
                size, MIN_ARENA_SIZE
            ));
            return Err(AllocError::InvalidParam);
        }

        let data_len = align_up(size, WORD_SIZE);
        let mut arena = Arena::acquire(data_len, META_WORDS, upstream, fit_mode)?;
        arena.set_meta(META_FIRST_BLOCK, 0);
        let owner = arena.owner();
        BlockHeader::free(data_len - BLOCK_HEADER_SIZE, None, None, owner).write(&mut arena, 0);

        diag.debug(format_args!(
            "boundary tags: arena of {} bytes ready ({})",
            data_len, fit_mode
        ));
        Ok(Self {
            inner: SpinNoIrq::new(BoundaryTags { arena }),
            diag,
        })
    }

    /// Allocate `size` bytes, rounded up to a word.
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.inner.lock().allocate(size, &self.diag)
    }

    /// Free a block returned by [`BoundaryTagAllocator::allocate`].
    ///
    /// Null is ignored. Double frees and foreign pointers are reported and
    /// leave the arena untouched.
    pub fn deallocate(&self, ptr: *mut u8) -> AllocResult {
        self.inner.lock().deallocate(ptr, &self.diag)
    }

    pub fn set_fit_mode(&self, mode: FitMode) {
        self.inner.lock().arena.set_fit_mode(mode);
        self.diag
            .debug(format_args!("boundary tags: fit mode set to {}", mode));
    }

    pub fn fit_mode(&self) -> FitMode {
        self.inner.lock().arena.fit_mode()
    }

    /// Blocks in address order; sizes include headers and sum to
    /// [`BoundaryTagAllocator::total_bytes`].
    pub fn list_blocks(&self) -> Vec<BlockInfo> {
        self.inner.lock().list_blocks()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().arena.data_len()
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> crate::stats::ArenaStats {
        crate::stats::ArenaStats::from_blocks(&self.list_blocks())
    }
}

impl RegionAllocator for BoundaryTagAllocator {
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

impl UpstreamAllocator for BoundaryTagAllocator {
    fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        Self::allocate(self, size)
    }

    fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        if let Err(_e) = Self::deallocate(self, ptr.as_ptr()) {
            warn!(
                "boundary tags: release of nested region {:#x} failed: {}",
                ptr.as_ptr() as usize,
                _e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const H: usize = BLOCK_HEADER_SIZE;

    fn new_allocator(size: usize) -> BoundaryTagAllocator {
        BoundaryTagAllocator::new(size, None, None, FitMode::FirstFit).unwrap()
    }

    #[test]
    fn test_init_single_free_block() {
        let allocator = new_allocator(1024);
        assert_eq!(allocator.list_blocks(), vec![BlockInfo::new(1024, false)]);
        assert_eq!(allocator.total_bytes(), 1024);
    }

    #[test]
    fn test_size_rounded_to_word() {
        let allocator = new_allocator(1021);
        assert_eq!(allocator.total_bytes(), 1024);
    }

    #[test]
    fn test_too_small() {
        let result = BoundaryTagAllocator::new(H, None, None, FitMode::FirstFit);
        assert!(matches!(result, Err(AllocError::InvalidParam)));
    }

    #[test]
    fn test_split_on_allocate() {
        let allocator = new_allocator(1024);
        let ptr = allocator.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % WORD_SIZE, 0);
        assert_eq!(
            allocator.list_blocks(),
            vec![
                BlockInfo::new(H + 104, true),
                BlockInfo::new(1024 - H - 104, false)
            ]
        );
    }

    #[test]
    fn test_no_split_for_small_remainder() {
        let allocator = new_allocator(1024);
        // Remainder equals one header: not worth a block of its own.
        let ptr = allocator.allocate(1024 - 2 * H).unwrap();
        assert_eq!(allocator.list_blocks(), vec![BlockInfo::new(1024, true)]);
        allocator.deallocate(ptr.as_ptr()).unwrap();
        assert_eq!(allocator.list_blocks(), vec![BlockInfo::new(1024, false)]);
    }

    #[test]
    fn test_merge_both_neighbours() {
        let allocator = new_allocator(1024);
        let a = allocator.allocate(64).unwrap();
        let b = allocator.allocate(64).unwrap();
        let c = allocator.allocate(64).unwrap();

        allocator.deallocate(a.as_ptr()).unwrap();
        allocator.deallocate(c.as_ptr()).unwrap();
        assert_eq!(
            allocator.list_blocks(),
            vec![
                BlockInfo::new(H + 64, false),
                BlockInfo::new(H + 64, true),
                BlockInfo::new(1024 - 2 * (H + 64), false),
            ]
        );

        allocator.deallocate(b.as_ptr()).unwrap();
        assert_eq!(allocator.list_blocks(), vec![BlockInfo::new(1024, false)]);
    }

    #[test]
    fn test_double_free_rejected() {
        let allocator = new_allocator(512);
        let ptr = allocator.allocate(32).unwrap();
        allocator.deallocate(ptr.as_ptr()).unwrap();
        let shape = allocator.list_blocks();

        assert_eq!(
            allocator.deallocate(ptr.as_ptr()),
            Err(AllocError::NotAllocated)
        );
        assert_eq!(allocator.list_blocks(), shape);
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let allocator = new_allocator(512);
        let other = new_allocator(512);
        let ptr = other.allocate(32).unwrap();

        assert_eq!(
            allocator.deallocate(ptr.as_ptr()),
            Err(AllocError::InvalidPointer)
        );
        assert_eq!(allocator.deallocate(core::ptr::null_mut()), Ok(()));
        other.deallocate(ptr.as_ptr()).unwrap();
    }

    #[test]
    fn test_interior_pointer_rejected() {
        let allocator = new_allocator(512);
        let ptr = allocator.allocate(128).unwrap();
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, 128) };
        let shape = allocator.list_blocks();

        let interior = unsafe { ptr.as_ptr().add(64) };
        assert_eq!(
            allocator.deallocate(interior),
            Err(AllocError::NotAllocated)
        );
        assert_eq!(
            allocator.deallocate(unsafe { ptr.as_ptr().add(1) }),
            Err(AllocError::InvalidPointer)
        );
        assert_eq!(allocator.list_blocks(), shape);
    }

    #[test]
    fn test_header_shaped_payload_with_wild_links() {
        let allocator = new_allocator(512);
        let ptr = allocator.allocate(128).unwrap();
        let shape = allocator.list_blocks();

        // Payload bytes that look like an allocated header linking far past
        // the end of the address space.
        {
            let mut tags = allocator.inner.lock();
            let owner = tags.arena.owner();
            let forged = BlockHeader {
                size: 8,
                allocated: true,
                prev: Some(usize::MAX - (2 * WORD_SIZE - 1)),
                next: Some(usize::MAX - (2 * WORD_SIZE - 1)),
                owner,
            };
            forged.write(&mut tags.arena, 64);
        }

        let interior = unsafe { ptr.as_ptr().add(64) };
        assert_eq!(
            allocator.deallocate(interior),
            Err(AllocError::NotAllocated)
        );
        assert_eq!(allocator.list_blocks(), shape);
        allocator.deallocate(ptr.as_ptr()).unwrap();
    }

    #[test]
    #[should_panic]
    fn test_corrupted_header_is_fatal() {
        let allocator = new_allocator(512);
        let ptr = allocator.allocate(32).unwrap();
        // Smash the size word of the block header.
        unsafe {
            ptr.as_ptr()
                .sub(BLOCK_HEADER_SIZE)
                .cast::<usize>()
                .write(usize::MAX - 1);
        }
        allocator.list_blocks();
    }
}
