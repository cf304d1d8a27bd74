//! Buddy block metadata
//!
//! Every block begins with a three-word header:
//!
//! ```text
//! ┌───────────────────────────────────────────┬──────┬──────┐
//! │ owner << 16 | occupied << 8 | size_class │ next │ prev │
//! └───────────────────────────────────────────┴──────┴──────┘
//! ```
//!
//! `next`/`prev` link free blocks of the same size class; they are
//! meaningless while the block is occupied.

use crate::arena::{link_to_word, word_to_link, Arena};
use crate::WORD_SIZE;

/// Bytes taken by the in-place header of every buddy block.
pub const BLOCK_HEADER_SIZE: usize = 3 * WORD_SIZE;

/// Smallest size class whose block can hold a header.
pub const MIN_SIZE_CLASS: usize = BLOCK_HEADER_SIZE.next_power_of_two().trailing_zeros() as usize;

/// Number of size classes addressable on this target.
pub const NUM_CLASSES: usize = usize::BITS as usize;

const OWNER_SHIFT: u32 = 16;
const OCCUPIED_SHIFT: u32 = 8;
const CLASS_MASK: usize = 0xff;

const PACKED_WORD: usize = 0;
const NEXT_WORD: usize = WORD_SIZE;
const PREV_WORD: usize = 2 * WORD_SIZE;

/// Bytes spanned by a block of `class`.
#[inline]
pub const fn class_size(class: usize) -> usize {
    1 << class
}

/// Smallest class whose block fits `bytes`, header included.
///
/// `None` if no class on this target is large enough.
pub fn class_for(bytes: usize) -> Option<usize> {
    let needed = bytes.checked_add(BLOCK_HEADER_SIZE)?;
    let class = needed.checked_next_power_of_two()?.trailing_zeros() as usize;
    Some(class.max(MIN_SIZE_CLASS))
}

/// Arena identity truncated to what fits above the occupied flag.
#[inline]
pub(crate) const fn owner_tag(owner: usize) -> usize {
    owner & (usize::MAX >> OWNER_SHIFT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BuddyHeader {
    pub class: usize,
    pub occupied: bool,
    /// Owner tag, see [`owner_tag`].
    pub owner: usize,
    pub next: Option<usize>,
    pub prev: Option<usize>,
}

impl BuddyHeader {
    pub const fn new(class: usize, occupied: bool, owner: usize) -> Self {
        Self {
            class,
            occupied,
            owner: owner_tag(owner),
            next: None,
            prev: None,
        }
    }

    pub const fn size(&self) -> usize {
        class_size(self.class)
    }

    pub fn read(arena: &Arena, offset: usize) -> Self {
        let packed = arena.word(offset + PACKED_WORD);
        Self {
            class: packed & CLASS_MASK,
            occupied: (packed >> OCCUPIED_SHIFT) & 1 != 0,
            owner: packed >> OWNER_SHIFT,
            next: word_to_link(arena.word(offset + NEXT_WORD)),
            prev: word_to_link(arena.word(offset + PREV_WORD)),
        }
    }

    pub fn write(&self, arena: &mut Arena, offset: usize) {
        debug_assert!(self.class < NUM_CLASSES);
        let packed = (owner_tag(self.owner) << OWNER_SHIFT)
            | ((self.occupied as usize) << OCCUPIED_SHIFT)
            | self.class;
        arena.set_word(offset + PACKED_WORD, packed);
        arena.set_word(offset + NEXT_WORD, link_to_word(self.next));
        arena.set_word(offset + PREV_WORD, link_to_word(self.prev));
    }

    pub fn set_next(arena: &mut Arena, offset: usize, next: Option<usize>) {
        arena.set_word(offset + NEXT_WORD, link_to_word(next));
    }

    pub fn set_prev(arena: &mut Arena, offset: usize, prev: Option<usize>) {
        arena.set_word(offset + PREV_WORD, link_to_word(prev));
    }

    /// Wipe the header of a block absorbed by a merge.
    pub fn clear(arena: &mut Arena, offset: usize) {
        arena.set_word(offset + PACKED_WORD, 0);
    }
}
