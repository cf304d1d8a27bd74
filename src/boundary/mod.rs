//! Boundary-tag region allocator
//!
//! Blocks tile the arena in address order and carry their own headers;
//! freed blocks are coalesced with free neighbours.

pub mod block;
pub mod boundary_allocator;

pub use block::BLOCK_HEADER_SIZE;
pub use boundary_allocator::{BoundaryTagAllocator, MIN_ARENA_SIZE};
