//! Sub-piece byte range, the unit of wire-level transfer

use std::fmt;

/// Standard block length used when slicing pieces for requests.
pub const BLOCK_SIZE: u32 = 16_384;

/// Immutable `(piece, offset, length)` identity of a block.
///
/// Two blocks are the same block when all three fields match. Ordering is
/// by piece, then offset, so ordered sets hand blocks out front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Splits a piece of `piece_size` bytes into `BLOCK_SIZE` chunks.
    ///
    /// The final block is truncated to the remainder.
    pub fn split_piece(piece: u32, piece_size: u32) -> Vec<Block> {
        (0..piece_size)
            .step_by(BLOCK_SIZE as usize)
            .map(|offset| Block::new(piece, offset, BLOCK_SIZE.min(piece_size - offset)))
            .collect()
    }

    /// Exclusive end offset within the piece.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.piece, self.offset, self.length)
    }
}
