//! Buddy-system region allocator
//!
//! This module provides a buddy system over a single arena with:
//! - Power-of-two size classes, split on allocate and merged on free
//! - Address-sorted free lists threaded through the free blocks
//! - Per-class free-list statistics

pub mod buddy_allocator;
pub mod buddy_block;
mod buddy_set;
mod free_list;

pub use buddy_allocator::{BuddyAllocator, MIN_ARENA_SIZE};
pub use buddy_block::{class_for, class_size, BLOCK_HEADER_SIZE, MIN_SIZE_CLASS, NUM_CLASSES};
