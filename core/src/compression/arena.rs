//! compression/arena.rs
//! Bump accounting over a fixed-size scratch budget.
//!
//! The zlib state lives inside flate2, so the arena hands out offsets and
//! lengths only; it backs no memory of its own. Blocks are released in
//! strict reverse order of allocation. Freeing any other block is refused,
//! and the owner checks `is_drained()` when a session ends.

use crate::compression::types::CompressionError;
use crate::utils::round_up;

/// Handle to one allocation. Carries the top-of-stack it replaced so a
/// LIFO free restores it exactly.
#[derive(Debug, PartialEq, Eq)]
pub struct ArenaBlock {
    offset: usize,
    len: usize,
    prev_top: usize,
}

impl ArenaBlock {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct ScratchArena {
    size: usize,
    top: usize,
    live: usize,
}

impl ScratchArena {
    pub fn new(size: usize) -> Self {
        Self { size, top: 0, live: 0 }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.size - self.top
    }

    /// Number of blocks currently allocated.
    #[inline]
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.live == 0 && self.top == 0
    }

    pub fn alloc(&mut self, len: usize, align: usize) -> Result<ArenaBlock, CompressionError> {
        let align = align.max(1);
        let offset = round_up(self.top, align);
        let end = offset.checked_add(len).filter(|&e| e <= self.size);
        let Some(end) = end else {
            return Err(CompressionError::ArenaExhausted { requested: len, available: self.available() });
        };
        let block = ArenaBlock { offset, len, prev_top: self.top };
        self.top = end;
        self.live += 1;
        Ok(block)
    }

    /// Release the most recent allocation.
    pub fn free(&mut self, block: ArenaBlock) -> Result<(), CompressionError> {
        let block_end = block.offset + block.len;
        if block_end != self.top || self.live == 0 {
            return Err(CompressionError::ArenaOrder { block_end, top: self.top });
        }
        self.top = block.prev_top;
        self.live -= 1;
        Ok(())
    }
}
