//! Slot mapping: logical token position to physical storage slot.
//!
//! A slot is a row index into the paged KV store:
//! `slot = block_id * block_size + offset`. The transform is stateless
//! and derivable from a block table and a sequence length.

use crate::cache::block::BlockId;

/// Sentinel slot for positions with no backing block. Writes to this
/// slot are skipped (padding is never materialized).
pub const PAD_SLOT: i64 = -1;

/// Physical slot for a single token position, or [`PAD_SLOT`] if the
/// position is beyond the mapped blocks.
pub fn slot_for_position(block_table: &[BlockId], position: usize, block_size: usize) -> i64 {
    match block_table.get(position / block_size) {
        Some(&block_id) => (block_id * block_size + position % block_size) as i64,
        None => PAD_SLOT,
    }
}

/// Map every position of a sequence to its physical slot.
///
/// Positions covered by the table get `block_id * block_size + offset`;
/// positions beyond the mapped blocks get [`PAD_SLOT`].
pub fn map_sequence_slots(block_table: &[BlockId], seq_len: usize, block_size: usize) -> Vec<i64> {
    (0..seq_len)
        .map(|pos| slot_for_position(block_table, pos, block_size))
        .collect()
}
