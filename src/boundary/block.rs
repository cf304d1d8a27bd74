//! Boundary-tag block header
//!
//! Each block starts with a four-word header followed by its payload:
//!
//! ```text
//! ┌──────────────────────┬──────┬──────┬───────┬──────────────────┐
//! │ size << 1 | allocated│ prev │ next │ owner │ payload (size)   │
//! └──────────────────────┴──────┴──────┴───────┴──────────────────┘
//! ```

use crate::arena::{link_to_word, word_to_link, Arena};
use crate::WORD_SIZE;

/// Bytes taken by the in-place header of every boundary-tag block.
pub const BLOCK_HEADER_SIZE: usize = 4 * WORD_SIZE;

/// Largest payload the packed size field can describe.
pub(crate) const MAX_PAYLOAD: usize = usize::MAX >> 1;

const SIZE_WORD: usize = 0;
const PREV_WORD: usize = WORD_SIZE;
const NEXT_WORD: usize = 2 * WORD_SIZE;
const OWNER_WORD: usize = 3 * WORD_SIZE;

/// Decoded copy of a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    /// Payload bytes following the header.
    pub size: usize,
    pub allocated: bool,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub owner: usize,
}

impl BlockHeader {
    pub const fn free(size: usize, prev: Option<usize>, next: Option<usize>, owner: usize) -> Self {
        Self {
            size,
            allocated: false,
            prev,
            next,
            owner,
        }
    }

    /// Bytes covered by the block, header included.
    pub const fn extent(&self) -> usize {
        BLOCK_HEADER_SIZE + self.size
    }

    pub fn read(arena: &Arena, offset: usize) -> Self {
        let packed = arena.word(offset + SIZE_WORD);
        Self {
            size: packed >> 1,
            allocated: packed & 1 != 0,
            prev: word_to_link(arena.word(offset + PREV_WORD)),
            next: word_to_link(arena.word(offset + NEXT_WORD)),
            owner: arena.word(offset + OWNER_WORD),
        }
    }

    pub fn write(&self, arena: &mut Arena, offset: usize) {
        debug_assert!(self.size <= MAX_PAYLOAD);
        arena.set_word(offset + SIZE_WORD, (self.size << 1) | self.allocated as usize);
        arena.set_word(offset + PREV_WORD, link_to_word(self.prev));
        arena.set_word(offset + NEXT_WORD, link_to_word(self.next));
        arena.set_word(offset + OWNER_WORD, self.owner);
    }

    /// Wipe the header of a block that was absorbed by a merge, so a stale
    /// pointer to it is rejected as not allocated.
    pub fn clear(arena: &mut Arena, offset: usize) {
        arena.set_word(offset + SIZE_WORD, 0);
        arena.set_word(offset + OWNER_WORD, 0);
    }
}
