//! Owned arena region
//!
//! The arena is one contiguous region obtained from an upstream allocator:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────┐
//! │ arena header (meta words)    │ data: blocks, each with its header   │
//! │ owner | total | fit | anchor │                                      │
//! └──────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Engines address blocks by offsets relative to the start of the data area.
//! Every word access is bounds-checked; an out-of-range internal offset means
//! the arena is corrupted and panics.

use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::error;

use crate::fit::FitMode;
use crate::upstream::{GlobalHeap, UpstreamAllocator};
use crate::{is_aligned, AllocError, AllocResult, WORD_SIZE};

/// Offset value standing for "no block".
pub(crate) const NIL: usize = usize::MAX;

/// Meta word holding the arena identity stamped into owned blocks.
const META_OWNER: usize = 0;
/// Meta word holding the usable size in bytes.
const META_TOTAL: usize = 1;
/// Meta word holding the encoded fit mode.
const META_FIT: usize = 2;
/// First meta word available to the engine's anchor.
pub(crate) const META_ANCHOR: usize = 3;

static NEXT_ARENA_ID: AtomicUsize = AtomicUsize::new(1);

#[inline]
pub(crate) fn link_to_word(link: Option<usize>) -> usize {
    link.unwrap_or(NIL)
}

#[inline]
pub(crate) fn word_to_link(word: usize) -> Option<usize> {
    (word != NIL).then_some(word)
}

pub(crate) struct Arena {
    base: NonNull<u8>,
    /// Bytes obtained from the upstream; handed back verbatim on drop.
    raw_len: usize,
    meta_len: usize,
    data_len: usize,
    upstream: Option<Arc<dyn UpstreamAllocator>>,
}

// SAFETY: the arena exclusively owns its region; every access goes through
// the allocator lock.
unsafe impl Send for Arena {}

impl Arena {
    /// Request `data_len + meta_words * WORD_SIZE` bytes and write the
    /// common arena header.
    pub(crate) fn acquire(
        data_len: usize,
        meta_words: usize,
        upstream: Option<Arc<dyn UpstreamAllocator>>,
        fit_mode: FitMode,
    ) -> AllocResult<Self> {
        debug_assert!(meta_words > META_ANCHOR);
        let meta_len = meta_words * WORD_SIZE;
        let raw_len = data_len
            .checked_add(meta_len)
            .ok_or(AllocError::InvalidParam)?;

        let base = match &upstream {
            Some(upstream) => upstream.allocate(raw_len)?,
            None => GlobalHeap::new().allocate(raw_len)?,
        };

        let mut arena = Self {
            base,
            raw_len,
            meta_len,
            data_len,
            upstream,
        };

        // Dropping `arena` from here on returns the region to its supplier.
        if !is_aligned(base.as_ptr() as usize, WORD_SIZE) {
            error!(
                "arena: upstream returned misaligned region {:#x}",
                base.as_ptr() as usize
            );
            return Err(AllocError::InvalidParam);
        }

        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);
        arena.set_meta(META_OWNER, id);
        arena.set_meta(META_TOTAL, data_len);
        arena.set_meta(META_FIT, fit_mode.to_word());
        Ok(arena)
    }

    /// Unique identity of this arena, never zero.
    pub(crate) fn owner(&self) -> usize {
        self.meta(META_OWNER)
    }

    pub(crate) fn data_len(&self) -> usize {
        self.meta(META_TOTAL)
    }

    pub(crate) fn fit_mode(&self) -> FitMode {
        let word = self.meta(META_FIT);
        match FitMode::from_word(word) {
            Some(mode) => mode,
            None => panic!("arena: corrupted fit mode word {:#x}", word),
        }
    }

    pub(crate) fn set_fit_mode(&mut self, mode: FitMode) {
        self.set_meta(META_FIT, mode.to_word());
    }

    pub(crate) fn meta(&self, index: usize) -> usize {
        assert!(
            (index + 1) * WORD_SIZE <= self.meta_len,
            "arena: meta word {} out of bounds",
            index
        );
        // SAFETY: bounds checked above; the region is owned by `self`.
        unsafe { self.base.as_ptr().cast::<usize>().add(index).read() }
    }

    pub(crate) fn set_meta(&mut self, index: usize, value: usize) {
        assert!(
            (index + 1) * WORD_SIZE <= self.meta_len,
            "arena: meta word {} out of bounds",
            index
        );
        // SAFETY: bounds checked above; the region is owned by `self`.
        unsafe { self.base.as_ptr().cast::<usize>().add(index).write(value) }
    }

    /// Read the word at data offset `offset`.
    pub(crate) fn word(&self, offset: usize) -> usize {
        self.check_word(offset);
        // SAFETY: in bounds and word aligned, checked by `check_word`.
        unsafe { self.data_start().add(offset).cast::<usize>().read() }
    }

    /// Write the word at data offset `offset`.
    pub(crate) fn set_word(&mut self, offset: usize, value: usize) {
        self.check_word(offset);
        // SAFETY: in bounds and word aligned, checked by `check_word`.
        unsafe { self.data_start().add(offset).cast::<usize>().write(value) }
    }

    /// Pointer to data offset `offset`.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset < self.data_len,
            "arena: offset {:#x} out of bounds",
            offset
        );
        // SAFETY: in bounds of the owned region, so never null.
        unsafe { NonNull::new_unchecked(self.data_start().add(offset)) }
    }

    /// Translate a client pointer into a data offset, if it points inside
    /// the data area.
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.data_start() as usize;
        let addr = ptr as usize;
        if addr < start || addr >= start + self.data_len {
            return None;
        }
        Some(addr - start)
    }

    fn data_start(&self) -> *mut u8 {
        // SAFETY: `meta_len <= raw_len`, the result stays within the region.
        unsafe { self.base.as_ptr().add(self.meta_len) }
    }

    fn check_word(&self, offset: usize) {
        assert!(
            offset <= self.data_len.saturating_sub(WORD_SIZE) && is_aligned(offset, WORD_SIZE),
            "arena: word offset {:#x} out of bounds (data size {:#x})",
            offset,
            self.data_len
        );
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match &self.upstream {
            Some(upstream) => upstream.deallocate(self.base, self.raw_len),
            None => GlobalHeap::new().deallocate(self.base, self.raw_len),
        }
    }
}
