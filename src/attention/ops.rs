//! Attention kernels over paged K/V storage.
//!
//! Two variants compute the same result:
//! - [`paged_attention_v1`] gathers a sequence's whole K/V through its
//!   block table and runs dense attention over it.
//! - [`paged_attention_v2`] walks the sequence in fixed partitions with
//!   an online softmax (running max, running exponential sum, rescaled
//!   accumulator), bounding peak gather memory for long sequences.
//!
//! Grouped-query attention is handled by replicating each KV head for
//! the query heads that share it. Queries are right-aligned against the
//! KV sequence: query row `i` sits at absolute position
//! `kv_len - q_len + i` for masking purposes.
//!
//! Layouts are token-major: `[len, num_heads, head_size]`, flattened.

use crate::cache::block::BlockId;
use crate::cache::store::PagedKVCache;
use crate::config::AttentionConfig;
use crate::error::{CacheError, Result};

/// Partition width used by [`paged_attention_v2`] unless overridden.
pub const DEFAULT_PARTITION_SIZE: usize = 512;

/// Repeat each KV head for the query heads that share it.
///
/// `kv` is `[len, num_kv_heads, head_size]`; the result is
/// `[len, num_kv_heads * num_queries_per_kv, head_size]`. A no-op copy
/// when `num_queries_per_kv` is 1. Fails if `kv` does not divide into
/// whole `[num_kv_heads, head_size]` rows.
pub fn expand_kv_for_gqa(
    kv: &[f32],
    num_kv_heads: usize,
    head_size: usize,
    num_queries_per_kv: usize,
) -> Result<Vec<f32>> {
    let kv_dim = num_kv_heads * head_size;
    if kv_dim == 0 || kv.len() % kv_dim != 0 {
        return Err(CacheError::ShapeMismatch(format!(
            "kv length {} not divisible into rows of {num_kv_heads} heads of {head_size}",
            kv.len()
        )));
    }
    if num_queries_per_kv == 1 {
        return Ok(kv.to_vec());
    }

    let len = kv.len() / kv_dim;
    let mut expanded = Vec::with_capacity(kv.len() * num_queries_per_kv);
    for row in 0..len {
        for kv_head in 0..num_kv_heads {
            let src = row * kv_dim + kv_head * head_size;
            for _ in 0..num_queries_per_kv {
                expanded.extend_from_slice(&kv[src..src + head_size]);
            }
        }
    }
    Ok(expanded)
}

/// Whether key position `key_pos` is masked for a query at absolute
/// position `query_pos`. The position is signed: non-causal calls may
/// have more query rows than keys, putting leading queries at negative
/// positions, where neither mask applies.
#[inline]
fn is_masked(query_pos: i64, key_pos: usize, causal: bool, sliding_window: Option<usize>) -> bool {
    let key_pos = key_pos as i64;
    if causal && key_pos > query_pos {
        return true;
    }
    if let Some(window) = sliding_window {
        if key_pos < query_pos && query_pos - key_pos >= window as i64 {
            return true;
        }
    }
    false
}

/// Dense scaled-dot-product attention: `softmax((q·kᵀ)·scale + mask)·v`.
///
/// `q` is `[q_len, num_heads, head_size]`; `k` and `v` are
/// `[kv_len, num_heads, head_size]` (expand GQA inputs first). The
/// softmax subtracts the row max before exponentiation for stability.
#[allow(clippy::too_many_arguments)]
pub fn scaled_dot_product_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    num_heads: usize,
    head_size: usize,
    scale: f32,
    causal: bool,
    sliding_window: Option<usize>,
) -> Result<Vec<f32>> {
    let dim = num_heads * head_size;
    if dim == 0 || q.len() % dim != 0 || k.len() % dim != 0 || k.len() != v.len() {
        return Err(CacheError::ShapeMismatch(format!(
            "q/k/v lengths {}/{}/{} not divisible into {num_heads} heads of {head_size}",
            q.len(),
            k.len(),
            v.len()
        )));
    }
    let q_len = q.len() / dim;
    let kv_len = k.len() / dim;
    if causal && q_len > kv_len {
        return Err(CacheError::ShapeMismatch(format!(
            "causal attention requires q_len ({q_len}) <= kv_len ({kv_len})"
        )));
    }

    let mut output = vec![0.0f32; q.len()];
    let mut scores = vec![0.0f32; kv_len];

    for head in 0..num_heads {
        for i in 0..q_len {
            let query_pos = kv_len as i64 - q_len as i64 + i as i64;
            let q_off = i * dim + head * head_size;

            let mut row_max = f32::NEG_INFINITY;
            for (j, score) in scores.iter_mut().enumerate() {
                if is_masked(query_pos, j, causal, sliding_window) {
                    *score = f32::NEG_INFINITY;
                    continue;
                }
                let k_off = j * dim + head * head_size;
                let mut dot = 0.0f32;
                for d in 0..head_size {
                    dot += q[q_off + d] * k[k_off + d];
                }
                *score = dot * scale;
                row_max = row_max.max(*score);
            }
            if row_max == f32::NEG_INFINITY {
                continue; // fully masked row stays zero
            }

            let mut exp_sum = 0.0f32;
            for score in scores.iter_mut() {
                *score = (*score - row_max).exp();
                exp_sum += *score;
            }

            let out_off = i * dim + head * head_size;
            for (j, &weight) in scores.iter().enumerate() {
                if weight == 0.0 {
                    continue;
                }
                let v_off = j * dim + head * head_size;
                for d in 0..head_size {
                    output[out_off + d] += weight * v[v_off + d];
                }
            }
            for d in 0..head_size {
                output[out_off + d] /= exp_sum;
            }
        }
    }

    Ok(output)
}

/// Paged attention, whole-sequence gather variant.
///
/// Gathers the sequence's cached K/V via its block table, replicates KV
/// heads for grouped-query attention, and runs dense attention.
/// `q` is `[q_len, num_heads, head_size]` and is right-aligned against
/// the `seq_len` cached positions.
pub fn paged_attention_v1(
    store: &PagedKVCache,
    q: &[f32],
    block_table: &[BlockId],
    seq_len: usize,
    config: &AttentionConfig,
    causal: bool,
) -> Result<Vec<f32>> {
    check_query_shape(store, q, config)?;
    let (k, v) = store.read_blocks(block_table, seq_len)?;
    let reps = config.num_queries_per_kv();
    let k = expand_kv_for_gqa(&k, config.num_kv_heads, config.head_size, reps)?;
    let v = expand_kv_for_gqa(&v, config.num_kv_heads, config.head_size, reps)?;
    scaled_dot_product_attention(
        q,
        &k,
        &v,
        config.num_heads,
        config.head_size,
        config.scale,
        causal,
        config.sliding_window,
    )
}

/// Paged attention, partitioned streaming-softmax variant.
///
/// Walks the KV sequence in `partition_size` chunks, maintaining a
/// running max `m`, exponential sum `l`, and weighted accumulator per
/// (head, query). Partitions merge by the standard rescale rule:
/// on a new partition max `m'`, the old `l` and accumulator are scaled
/// by `exp(m - m')` before the partition's terms are added.
/// Numerically equivalent to [`paged_attention_v1`] within floating
/// tolerance; exists to bound peak memory on long sequences.
#[allow(clippy::too_many_arguments)]
pub fn paged_attention_v2(
    store: &PagedKVCache,
    q: &[f32],
    block_table: &[BlockId],
    seq_len: usize,
    config: &AttentionConfig,
    causal: bool,
    partition_size: usize,
) -> Result<Vec<f32>> {
    check_query_shape(store, q, config)?;
    if partition_size == 0 {
        return Err(CacheError::Configuration(
            "partition_size must be positive".to_string(),
        ));
    }

    let num_heads = config.num_heads;
    let head_size = config.head_size;
    let kv_dim = config.kv_dim();
    let reps = config.num_queries_per_kv();
    let dim = num_heads * head_size;
    let q_len = q.len() / dim;
    if causal && q_len > seq_len {
        return Err(CacheError::ShapeMismatch(format!(
            "causal attention requires q_len ({q_len}) <= seq_len ({seq_len})"
        )));
    }

    // Running state per (query row, head).
    let mut run_max = vec![f32::NEG_INFINITY; q_len * num_heads];
    let mut run_sum = vec![0.0f32; q_len * num_heads];
    let mut acc = vec![0.0f32; q.len()];

    let mut part_start = 0;
    while part_start < seq_len {
        let part_end = (part_start + partition_size).min(seq_len);
        let (k_part, v_part) = store.read_range(block_table, part_start, part_end)?;

        for head in 0..num_heads {
            let kv_head = head / reps;
            for i in 0..q_len {
                let query_pos = seq_len as i64 - q_len as i64 + i as i64;
                let q_off = i * dim + head * head_size;
                let state = i * num_heads + head;

                // Partition-local scores with masks applied.
                let mut part_max = f32::NEG_INFINITY;
                let mut part_scores = Vec::with_capacity(part_end - part_start);
                for jj in 0..(part_end - part_start) {
                    let key_pos = part_start + jj;
                    if is_masked(query_pos, key_pos, causal, config.sliding_window) {
                        part_scores.push(f32::NEG_INFINITY);
                        continue;
                    }
                    let k_off = jj * kv_dim + kv_head * head_size;
                    let mut dot = 0.0f32;
                    for d in 0..head_size {
                        dot += q[q_off + d] * k_part[k_off + d];
                    }
                    let score = dot * config.scale;
                    part_scores.push(score);
                    part_max = part_max.max(score);
                }
                if part_max == f32::NEG_INFINITY {
                    continue; // whole partition masked for this query
                }

                // Rescale-and-merge with the running state.
                let new_max = run_max[state].max(part_max);
                let rescale = (run_max[state] - new_max).exp(); // 0 on first partition
                run_max[state] = new_max;
                run_sum[state] *= rescale;
                let out_off = i * dim + head * head_size;
                for d in 0..head_size {
                    acc[out_off + d] *= rescale;
                }

                for (jj, &score) in part_scores.iter().enumerate() {
                    if score == f32::NEG_INFINITY {
                        continue;
                    }
                    let weight = (score - new_max).exp();
                    run_sum[state] += weight;
                    let v_off = jj * kv_dim + kv_head * head_size;
                    for d in 0..head_size {
                        acc[out_off + d] += weight * v_part[v_off + d];
                    }
                }
            }
        }

        part_start = part_end;
    }

    // Normalize; fully masked rows stay zero.
    for head in 0..num_heads {
        for i in 0..q_len {
            let state = i * num_heads + head;
            if run_sum[state] == 0.0 {
                continue;
            }
            let out_off = i * dim + head * head_size;
            for d in 0..head_size {
                acc[out_off + d] /= run_sum[state];
            }
        }
    }

    Ok(acc)
}

fn check_query_shape(store: &PagedKVCache, q: &[f32], config: &AttentionConfig) -> Result<()> {
    config.validate()?;
    if store.kv_dim() != config.kv_dim() {
        return Err(CacheError::ShapeMismatch(format!(
            "store kv_dim {} does not match config kv_dim {}",
            store.kv_dim(),
            config.kv_dim()
        )));
    }
    let dim = config.num_heads * config.head_size;
    if q.is_empty() || q.len() % dim != 0 {
        return Err(CacheError::ShapeMismatch(format!(
            "query length {} not divisible into {} heads of {}",
            q.len(),
            config.num_heads,
            config.head_size
        )));
    }
    Ok(())
}
