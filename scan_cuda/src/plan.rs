//! Block decomposition and scratch sizing.
//!
//! A scan runs in levels. Level 0 is the input, split into blocks of
//! [`BLOCK_SIZE`] elements. While a level has more than one block, every block
//! leaves one partial total in scratch and those totals are the elements of the
//! next level. The last level always fits in a single block and needs no
//! scratch of its own.

use scan_gpu::BLOCK_SIZE;
use std::mem;
use std::ops::Range;

/// One level of the block decomposition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Level {
    /// Number of elements scanned at this level.
    pub len: usize,

    /// Number of blocks the level is launched with.
    pub blocks: usize,

    /// Element range of this level's block totals inside the scratch region.
    /// Empty for the last level.
    pub totals: Range<usize>,
}

impl Level {
    pub fn is_last(&self) -> bool {
        self.blocks == 1
    }
}

/// Returns the levels needed to scan `n` elements. Empty when `n` is zero.
pub fn scan_levels(n: usize) -> Vec<Level> {
    let mut levels = vec![];
    let mut len = n;
    let mut offset = 0;
    while len > BLOCK_SIZE {
        let blocks = div_ceil(len, BLOCK_SIZE);
        levels.push(Level {
            len,
            blocks,
            totals: offset..offset + blocks,
        });
        offset += blocks;
        len = blocks;
    }
    if len > 0 {
        levels.push(Level {
            len,
            blocks: 1,
            totals: offset..offset,
        });
    }
    levels
}

/// The number of partial-total slots a scan of `n` elements needs.
pub fn partial_slots(n: usize) -> usize {
    scan_levels(n).iter().map(|level| level.totals.len()).sum()
}

/// Number of scratch bytes (`NumParts`) a scan of `n` elements of `T` needs.
///
/// Both modes share one layout: the exclusive shift happens inside the first
/// level's blocks, and the totals of every level are inclusive.
pub fn scratch_size<T>(n: usize, _inclusive: bool) -> usize {
    partial_slots(n) * mem::size_of::<T>()
}

fn div_ceil(numerator: usize, denominator: usize) -> usize {
    (numerator + denominator - 1) / denominator
}
