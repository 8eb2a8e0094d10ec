//! Per-batch attention metadata.
//!
//! Bridges cache state to the compute kernel: cumulative query offsets,
//! a block-table matrix padded to a fixed width, and the flattened slot
//! mapping for writing freshly computed K/V.

use crate::cache::block::BlockId;
use crate::cache::slot::map_sequence_slots;
use crate::error::{CacheError, Result};

/// Batch-assembled tensors for one model step.
#[derive(Debug, Clone)]
pub struct AttentionMetadata {
    /// Per-sequence token counts.
    pub seq_lens: Vec<usize>,

    /// Cumulative query offsets, length `num_seqs + 1`;
    /// sequence `i` owns query rows `[query_start_locs[i],
    /// query_start_locs[i + 1])`.
    pub query_start_locs: Vec<usize>,

    /// Block-table matrix, `[num_seqs, max_blocks_per_seq]` flattened,
    /// padded with `-1` for sequences with fewer blocks.
    pub block_tables: Vec<i64>,

    /// Matrix width.
    pub max_blocks_per_seq: usize,

    /// Physical slot per token across the whole batch,
    /// length `total_tokens`.
    pub slot_mapping: Vec<i64>,

    /// `sum(seq_lens)`.
    pub total_tokens: usize,
}

impl AttentionMetadata {
    /// Assemble metadata from per-sequence lengths and block tables.
    ///
    /// Fails when the two inputs disagree in length, a table exceeds
    /// `max_blocks_per_seq`, or a table is too short to map its
    /// sequence's positions.
    pub fn from_seq_lens(
        seq_lens: &[usize],
        block_tables: &[Vec<BlockId>],
        block_size: usize,
        max_blocks_per_seq: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(CacheError::Configuration(
                "block_size must be positive".to_string(),
            ));
        }
        if seq_lens.len() != block_tables.len() {
            return Err(CacheError::ShapeMismatch(format!(
                "{} seq_lens but {} block tables",
                seq_lens.len(),
                block_tables.len()
            )));
        }

        let mut query_start_locs = Vec::with_capacity(seq_lens.len() + 1);
        query_start_locs.push(0);
        let mut padded_tables = Vec::with_capacity(seq_lens.len() * max_blocks_per_seq);
        let mut slot_mapping = Vec::new();
        let mut total_tokens = 0;

        for (i, (&seq_len, table)) in seq_lens.iter().zip(block_tables).enumerate() {
            if table.len() > max_blocks_per_seq {
                return Err(CacheError::ShapeMismatch(format!(
                    "sequence {i} has {} blocks, max_blocks_per_seq is {max_blocks_per_seq}",
                    table.len()
                )));
            }
            if table.len() < seq_len.div_ceil(block_size) {
                return Err(CacheError::ShapeMismatch(format!(
                    "sequence {i} has {} blocks, {} needed for seq_len {seq_len}",
                    table.len(),
                    seq_len.div_ceil(block_size)
                )));
            }

            total_tokens += seq_len;
            query_start_locs.push(total_tokens);

            padded_tables.extend(table.iter().map(|&id| id as i64));
            padded_tables.extend(std::iter::repeat(-1).take(max_blocks_per_seq - table.len()));

            slot_mapping.extend(map_sequence_slots(table, seq_len, block_size));
        }

        debug_assert_eq!(slot_mapping.len(), total_tokens);
        Ok(Self {
            seq_lens: seq_lens.to_vec(),
            query_start_locs,
            block_tables: padded_tables,
            max_blocks_per_seq,
            slot_mapping,
            total_tokens,
        })
    }

    /// Number of sequences in the batch.
    pub fn num_seqs(&self) -> usize {
        self.seq_lens.len()
    }

    /// One sequence's row of the padded block-table matrix.
    pub fn block_table_row(&self, seq: usize) -> &[i64] {
        let start = seq * self.max_blocks_per_seq;
        &self.block_tables[start..start + self.max_blocks_per_seq]
    }
}
