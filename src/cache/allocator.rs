//! Block allocator: a fixed pool of physical block ids and the
//! per-sequence tables that own them.
//!
//! This is the plain (non-content-addressed) allocation path: each
//! sequence gets exclusive blocks from the free pool and returns them
//! all when it terminates. `live + free == max_blocks` at all times.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::cache::block::{BlockId, BlockTable};
use crate::error::{CacheError, Result};

/// Fixed-capacity allocator handing out physical block ids.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Ids available for allocation.
    free: VecDeque<BlockId>,

    /// Block tables indexed by sequence id.
    tables: HashMap<u64, BlockTable>,

    /// Tokens per block.
    block_size: usize,

    /// Total pool capacity.
    max_blocks: usize,
}

impl BlockAllocator {
    /// Create an allocator over `max_blocks` physical blocks.
    pub fn new(max_blocks: usize, block_size: usize) -> Result<Self> {
        if max_blocks == 0 || block_size == 0 {
            return Err(CacheError::Configuration(
                "max_blocks and block_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            free: (0..max_blocks).collect(),
            tables: HashMap::new(),
            block_size,
            max_blocks,
        })
    }

    /// Allocate one block for a sequence, appending it to the
    /// sequence's table. Fails with `OutOfBlocks` when the pool is empty.
    pub fn allocate_block(&mut self, seq_id: u64) -> Result<BlockId> {
        let block_id = self.free.pop_front().ok_or(CacheError::OutOfBlocks {
            capacity: self.max_blocks,
        })?;
        self.tables
            .entry(seq_id)
            .or_insert_with(|| BlockTable::new(seq_id, self.block_size))
            .push(block_id);
        debug!(seq_id, block_id, "Allocated block");
        Ok(block_id)
    }

    /// Return all of a sequence's blocks to the pool. Unknown sequence
    /// ids free nothing.
    pub fn free_sequence(&mut self, seq_id: u64) -> Vec<BlockId> {
        let freed = match self.tables.remove(&seq_id) {
            Some(table) => table.blocks,
            None => return Vec::new(),
        };
        for &block_id in &freed {
            self.free.push_back(block_id);
        }
        debug!(seq_id, count = freed.len(), "Freed sequence blocks");
        freed
    }

    /// The block table for a sequence, if any.
    pub fn block_table(&self, seq_id: u64) -> Option<&BlockTable> {
        self.tables.get(&seq_id)
    }

    /// Blocks currently available.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Blocks currently owned by sequences.
    pub fn num_live(&self) -> usize {
        self.max_blocks - self.free.len()
    }

    /// Total pool capacity.
    pub fn capacity(&self) -> usize {
        self.max_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_round_trip() {
        let mut alloc = BlockAllocator::new(4, 16).unwrap();
        let a = alloc.allocate_block(1).unwrap();
        let b = alloc.allocate_block(1).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.num_live(), 2);
        assert_eq!(alloc.num_free(), 2);
        assert_eq!(alloc.block_table(1).unwrap().blocks, vec![a, b]);

        let freed = alloc.free_sequence(1);
        assert_eq!(freed, vec![a, b]);
        assert_eq!(alloc.num_free(), 4);
        assert!(alloc.block_table(1).is_none());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut alloc = BlockAllocator::new(2, 16).unwrap();
        alloc.allocate_block(1).unwrap();
        alloc.allocate_block(2).unwrap();
        let err = alloc.allocate_block(3).unwrap_err();
        assert!(matches!(err, CacheError::OutOfBlocks { capacity: 2 }));
        // Failed allocation changes nothing.
        assert_eq!(alloc.num_live() + alloc.num_free(), 2);
    }

    #[test]
    fn test_free_unknown_sequence_is_noop() {
        let mut alloc = BlockAllocator::new(2, 16).unwrap();
        assert!(alloc.free_sequence(99).is_empty());
        assert_eq!(alloc.num_free(), 2);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BlockAllocator::new(0, 16).is_err());
        assert!(BlockAllocator::new(8, 0).is_err());
    }
}
