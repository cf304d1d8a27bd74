//! Per-class free lists threaded through the arena
//!
//! Nodes are the free blocks themselves: links live in the block headers and
//! the list head lives in the arena header. Lists are kept sorted by offset,
//! so scans visit free blocks in address order.

use super::buddy_block::{class_size, BuddyHeader};
use crate::arena::{link_to_word, word_to_link, Arena};

/// Handle on the free list of one size class.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeList {
    class: usize,
    /// Meta word holding the head offset.
    head_word: usize,
}

impl FreeList {
    pub const fn new(class: usize, head_word: usize) -> Self {
        Self { class, head_word }
    }

    pub fn head(&self, arena: &Arena) -> Option<usize> {
        word_to_link(arena.meta(self.head_word))
    }

    fn set_head(&self, arena: &mut Arena, head: Option<usize>) {
        arena.set_meta(self.head_word, link_to_word(head));
    }

    #[cfg(test)]
    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.head(arena).is_none()
    }

    /// Reset the list to empty.
    pub fn clear(&self, arena: &mut Arena) {
        self.set_head(arena, None);
    }

    pub fn iter<'a>(&self, arena: &'a Arena) -> FreeListIter<'a> {
        FreeListIter {
            arena,
            class: self.class,
            current: self.head(arena),
            prev: None,
            remaining: arena.data_len() / class_size(self.class),
        }
    }

    #[cfg_attr(not(feature = "tracking"), allow(dead_code))]
    pub fn len(&self, arena: &Arena) -> usize {
        self.iter(arena).count()
    }

    /// Insert the block at `offset` keeping the list sorted by offset.
    ///
    /// The block header must already be written; only its links change.
    pub fn insert_sorted(&self, arena: &mut Arena, offset: usize) {
        let mut prev = None;
        let mut current = self.head(arena);
        for node in self.iter(arena) {
            assert!(
                node != offset,
                "buddy system: block {:#x} already on free list {}",
                offset,
                self.class
            );
            if node > offset {
                break;
            }
            prev = Some(node);
            current = BuddyHeader::read(arena, node).next;
        }

        BuddyHeader::set_prev(arena, offset, prev);
        BuddyHeader::set_next(arena, offset, current);
        match prev {
            Some(prev) => BuddyHeader::set_next(arena, prev, Some(offset)),
            None => self.set_head(arena, Some(offset)),
        }
        if let Some(next) = current {
            BuddyHeader::set_prev(arena, next, Some(offset));
        }
    }

    /// Unlink the block at `offset` using its own links.
    pub fn remove(&self, arena: &mut Arena, offset: usize) {
        let node = BuddyHeader::read(arena, offset);
        match node.prev {
            Some(prev) => BuddyHeader::set_next(arena, prev, node.next),
            None => {
                assert!(
                    self.head(arena) == Some(offset),
                    "buddy system: block {:#x} is not on free list {}",
                    offset,
                    self.class
                );
                self.set_head(arena, node.next);
            }
        }
        if let Some(next) = node.next {
            BuddyHeader::set_prev(arena, next, node.prev);
        }
        BuddyHeader::set_next(arena, offset, None);
        BuddyHeader::set_prev(arena, offset, None);
    }

    /// Remove and return the lowest-addressed block.
    #[cfg(test)]
    pub fn pop_front(&self, arena: &mut Arena) -> Option<usize> {
        let head = self.head(arena)?;
        self.remove(arena, head);
        Some(head)
    }
}

/// Offsets on one free list, in address order.
///
/// Panics on a link that breaks the ordering, points at a block of another
/// class, or loops.
pub(crate) struct FreeListIter<'a> {
    arena: &'a Arena,
    class: usize,
    current: Option<usize>,
    prev: Option<usize>,
    remaining: usize,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let offset = self.current?;
        let size = class_size(self.class);
        assert!(
            self.remaining > 0
                && offset % size == 0
                && offset + size <= self.arena.data_len()
                && self.prev.map_or(true, |prev| prev < offset),
            "buddy system: corrupted free list {} at {:#x}",
            self.class,
            offset
        );

        let node = BuddyHeader::read(self.arena, offset);
        assert!(
            node.class == self.class && !node.occupied && node.prev == self.prev,
            "buddy system: corrupted free block at {:#x}: {:?}",
            offset,
            node
        );

        self.remaining -= 1;
        self.prev = Some(offset);
        self.current = node.next;
        Some(offset)
    }
}
