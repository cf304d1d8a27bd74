//! Arena statistics and failure reporting
//!
//! Statistics are derived from an arena walk, so they always agree with
//! `list_blocks()`.

use crate::diagnostics::Diagnostics;
use crate::BlockInfo;

/// Occupancy summary of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Extent of the largest free block, header included.
    pub largest_free_block: usize,
}

impl ArenaStats {
    pub const fn new() -> Self {
        Self {
            total_bytes: 0,
            used_bytes: 0,
            free_bytes: 0,
            used_blocks: 0,
            free_blocks: 0,
            largest_free_block: 0,
        }
    }

    pub fn from_blocks(blocks: &[BlockInfo]) -> Self {
        let mut stats = Self::new();
        for block in blocks {
            stats.total_bytes += block.size;
            if block.occupied {
                stats.used_bytes += block.size;
                stats.used_blocks += 1;
            } else {
                stats.free_bytes += block.size;
                stats.free_blocks += 1;
                stats.largest_free_block = stats.largest_free_block.max(block.size);
            }
        }
        stats
    }
}

/// Log the arena state after a failed allocation.
pub(crate) fn report_alloc_failure(
    diag: &Diagnostics,
    engine: &str,
    request: usize,
    blocks: &[BlockInfo],
) {
    let stats = ArenaStats::from_blocks(blocks);
    diag.error(format_args!("========================================"));
    diag.error(format_args!("{}: request of {} bytes failed", engine, request));
    diag.error(format_args!("Arena state:"));
    diag.error(format_args!("  Total: {} bytes", stats.total_bytes));
    diag.error(format_args!(
        "  Used: {} bytes in {} blocks",
        stats.used_bytes, stats.used_blocks
    ));
    diag.error(format_args!(
        "  Free: {} bytes in {} blocks",
        stats.free_bytes, stats.free_blocks
    ));
    diag.error(format_args!(
        "  Largest free block: {} bytes",
        stats.largest_free_block
    ));
    diag.error(format_args!("========================================"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_blocks() {
        let blocks = [
            BlockInfo::new(136, true),
            BlockInfo::new(64, false),
            BlockInfo::new(200, true),
            BlockInfo::new(624, false),
        ];
        let stats = ArenaStats::from_blocks(&blocks);
        assert_eq!(stats.total_bytes, 1024);
        assert_eq!(stats.used_bytes, 336);
        assert_eq!(stats.free_bytes, 688);
        assert_eq!(stats.used_blocks, 2);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.largest_free_block, 624);
    }

    #[test]
    fn test_empty() {
        assert_eq!(ArenaStats::from_blocks(&[]), ArenaStats::default());
    }
}
