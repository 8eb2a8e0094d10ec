//! Paged KV store: fixed-capacity, block-organized key/value storage.
//!
//! Keys and values live in two flat FP16 arenas of shape
//! `[max_blocks * block_size, num_kv_heads * head_size]`. Writes scatter
//! fresh rows through a slot mapping; reads gather a sequence's rows
//! back through its block table. The compute API is f32 on both sides.

use half::f16;
use tracing::info;

use crate::cache::block::BlockId;
use crate::cache::slot::PAD_SLOT;
use crate::error::{CacheError, Result};

/// Block-organized storage for key/value vectors.
#[derive(Debug)]
pub struct PagedKVCache {
    /// Key rows, `[num_slots, kv_dim]` flattened.
    keys: Vec<f16>,

    /// Value rows, same shape as `keys`.
    values: Vec<f16>,

    max_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_size: usize,
}

impl PagedKVCache {
    /// Pre-allocate storage for `max_blocks` blocks.
    pub fn new(
        max_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> Result<Self> {
        if max_blocks == 0 || block_size == 0 || num_kv_heads == 0 || head_size == 0 {
            return Err(CacheError::Configuration(
                "paged KV cache dimensions must be positive".to_string(),
            ));
        }

        let num_slots = max_blocks * block_size;
        let kv_dim = num_kv_heads * head_size;
        let bytes = num_slots * kv_dim * 2 * std::mem::size_of::<f16>();
        info!(
            max_blocks,
            block_size,
            num_kv_heads,
            head_size,
            mb = bytes as f64 / (1024.0 * 1024.0),
            "Paged KV cache allocated"
        );

        Ok(Self {
            keys: vec![f16::ZERO; num_slots * kv_dim],
            values: vec![f16::ZERO; num_slots * kv_dim],
            max_blocks,
            block_size,
            num_kv_heads,
            head_size,
        })
    }

    /// Width of one storage row: `num_kv_heads * head_size`.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_size
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total slot count.
    pub fn num_slots(&self) -> usize {
        self.max_blocks * self.block_size
    }

    /// Scatter-write key/value rows through a slot mapping.
    ///
    /// `key` and `value` are `[slot_mapping.len(), kv_dim]` flattened.
    /// Rows whose slot is [`PAD_SLOT`] are skipped.
    pub fn write(&mut self, key: &[f32], value: &[f32], slot_mapping: &[i64]) -> Result<()> {
        let kv_dim = self.kv_dim();
        let expected = slot_mapping.len() * kv_dim;
        if key.len() != expected || value.len() != expected {
            return Err(CacheError::ShapeMismatch(format!(
                "expected {} key/value elements for {} slots, got {}/{}",
                expected,
                slot_mapping.len(),
                key.len(),
                value.len()
            )));
        }

        for (row, &slot) in slot_mapping.iter().enumerate() {
            if slot == PAD_SLOT {
                continue;
            }
            let slot = usize::try_from(slot).map_err(|_| {
                CacheError::ShapeMismatch(format!("negative slot {slot} is not a pad sentinel"))
            })?;
            if slot >= self.num_slots() {
                return Err(CacheError::ShapeMismatch(format!(
                    "slot {slot} out of range for {} slots",
                    self.num_slots()
                )));
            }

            let src = row * kv_dim;
            let dst = slot * kv_dim;
            for d in 0..kv_dim {
                self.keys[dst + d] = f16::from_f32(key[src + d]);
                self.values[dst + d] = f16::from_f32(value[src + d]);
            }
        }
        Ok(())
    }

    /// Gather exactly `seq_len` key/value rows for a sequence.
    ///
    /// The final block may have spare capacity; rows past `seq_len` are
    /// never read. Returns `(keys, values)`, each `[seq_len, kv_dim]`.
    pub fn read_blocks(
        &self,
        block_table: &[BlockId],
        seq_len: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        self.read_range(block_table, 0, seq_len)
    }

    /// Gather key/value rows for positions `[start, end)` of a
    /// sequence. Used by the partitioned attention variant to bound
    /// peak gather memory.
    pub fn read_range(
        &self,
        block_table: &[BlockId],
        start: usize,
        end: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let needed_blocks = end.div_ceil(self.block_size);
        if block_table.len() < needed_blocks {
            return Err(CacheError::ShapeMismatch(format!(
                "block table has {} blocks, {} needed for position {}",
                block_table.len(),
                needed_blocks,
                end
            )));
        }

        let kv_dim = self.kv_dim();
        let mut keys = Vec::with_capacity((end - start) * kv_dim);
        let mut values = Vec::with_capacity((end - start) * kv_dim);

        for pos in start..end {
            let block_id = block_table[pos / self.block_size];
            if block_id >= self.max_blocks {
                return Err(CacheError::ShapeMismatch(format!(
                    "block id {block_id} out of range for {} blocks",
                    self.max_blocks
                )));
            }
            let slot = block_id * self.block_size + pos % self.block_size;
            let src = slot * kv_dim;
            keys.extend(self.keys[src..src + kv_dim].iter().map(|v| v.to_f32()));
            values.extend(self.values[src..src + kv_dim].iter().map(|v| v.to_f32()));
        }

        Ok((keys, values))
    }
}
