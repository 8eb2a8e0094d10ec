//! Content-addressable prefix cache manager.
//!
//! The manager is the central coordinator for prefix reuse. It:
//! - Splits incoming token ids into `block_size` chunks and hashes each
//!   full chunk (a trailing partial chunk is never cached or shared)
//! - Maps chunk hashes to physical blocks, sharing blocks across
//!   requests via reference counting
//! - Evicts unreferenced, unpinned blocks under capacity pressure
//! - Tracks hit/miss/eviction/sharing counters for the scheduler
//!
//! The manager is not internally thread-safe: every operation,
//! including read paths that touch access bookkeeping, is a multi-step
//! read-modify-write. Callers with multiple workers serialize access
//! behind [`SharedPrefixCache`]; [`BlockLease`] guarantees release on
//! every exit path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::block::{hash_token_chunk, Block, BlockId, TokenId};
use crate::cache::evictor::Evictor;
use crate::cache::stats::CacheStats;
use crate::config::PrefixCacheConfig;
use crate::error::{CacheError, Result};

/// Hash-indexed, reference-counted block cache.
#[derive(Debug)]
pub struct PrefixCacheManager {
    config: PrefixCacheConfig,

    /// All cached blocks, indexed by pool id.
    blocks: HashMap<BlockId, Block>,

    /// Content hash → block id. Populated only when sharing is enabled;
    /// a colliding block is never entered here.
    hash_index: HashMap<String, BlockId>,

    /// Blocks leased per request id, in allocation order, for release.
    requests: HashMap<String, Vec<BlockId>>,

    /// Pool ids not currently backing a cached block.
    free_ids: VecDeque<BlockId>,

    /// Ordered index over freeable blocks.
    evictor: Evictor,

    stats: CacheStats,

    /// Monotonic sequence shared by insertion and access bookkeeping.
    clock: u64,
}

impl PrefixCacheManager {
    /// Create a manager. Fails fast on an invalid configuration.
    pub fn new(config: PrefixCacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            block_size = config.block_size,
            max_blocks = config.max_blocks,
            policy = %config.eviction_policy,
            sharing = config.enable_sharing,
            "Prefix cache initialized"
        );
        Ok(Self {
            free_ids: (0..config.max_blocks).collect(),
            evictor: Evictor::new(config.eviction_policy),
            blocks: HashMap::new(),
            hash_index: HashMap::new(),
            requests: HashMap::new(),
            stats: CacheStats::default(),
            clock: 0,
            config,
        })
    }

    /// Allocate blocks for a request's token ids, reusing cached blocks
    /// where an identical full chunk is already present.
    ///
    /// The returned ids are a mix of shared and new blocks, one per full
    /// `block_size` chunk; a trailing partial chunk is dropped from
    /// caching. The lease is recorded under `request_id` for
    /// [`release_blocks`](Self::release_blocks), including the partial
    /// lease acquired before a `CacheFull` failure, so a failed
    /// admission is still releasable.
    pub fn allocate_blocks(
        &mut self,
        request_id: &str,
        token_ids: &[TokenId],
    ) -> Result<Vec<BlockId>> {
        self.stats.num_tokens += token_ids.len() as u64;

        let mut acquired = Vec::new();
        for chunk in token_ids.chunks_exact(self.config.block_size) {
            match self.acquire_chunk(chunk) {
                Ok(block_id) => acquired.push(block_id),
                Err(err) => {
                    self.record_lease(request_id, &acquired);
                    return Err(err);
                }
            }
        }

        debug!(
            request_id,
            blocks = acquired.len(),
            tokens = token_ids.len(),
            "Allocated blocks"
        );
        self.record_lease(request_id, &acquired);
        Ok(acquired)
    }

    /// Release every block previously returned to `request_id`,
    /// decrementing ref counts (floored at zero). Unknown request ids
    /// are a no-op.
    ///
    /// Must run on every termination path of a request: success,
    /// error, cancellation. [`BlockLease`] automates this.
    pub fn release_blocks(&mut self, request_id: &str) {
        let Some(block_ids) = self.requests.remove(request_id) else {
            return;
        };
        for block_id in &block_ids {
            if let Some(block) = self.blocks.get_mut(block_id) {
                block.ref_count = block.ref_count.saturating_sub(1);
                if block.is_evictable() {
                    self.evictor.insert(block);
                }
            }
        }
        debug!(request_id, blocks = block_ids.len(), "Released blocks");
    }

    /// Read-only longest-prefix match: block ids for the leading full
    /// chunks already cached, stopping at the first absent chunk. Does
    /// not mutate ref counts or access bookkeeping (planning, not
    /// admission).
    pub fn lookup_prefix(&self, token_ids: &[TokenId]) -> Vec<BlockId> {
        let mut matched = Vec::new();
        for chunk in token_ids.chunks_exact(self.config.block_size) {
            let hash = hash_token_chunk(chunk, self.config.hash_algorithm);
            match self
                .hash_index
                .get(&hash)
                .and_then(|id| self.blocks.get(id))
            {
                Some(block) if block.tokens.as_slice() == chunk => matched.push(block.id),
                _ => break,
            }
        }
        matched
    }

    /// Exempt a block from eviction. Returns false for unknown ids.
    pub fn pin_block(&mut self, block_id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(&block_id) else {
            return false;
        };
        block.pinned = true;
        self.evictor.remove(block_id);
        true
    }

    /// Reinstate a block's eviction eligibility. Returns false for
    /// unknown ids.
    pub fn unpin_block(&mut self, block_id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(&block_id) else {
            return false;
        };
        block.pinned = false;
        if block.is_evictable() {
            self.evictor.insert(block);
        }
        true
    }

    /// Fetch a block, counting the read for LRU/LFU purposes.
    /// Unknown ids return `None` rather than an error.
    pub fn get_block(&mut self, block_id: BlockId) -> Option<&Block> {
        self.clock += 1;
        let seq = self.clock;
        let block = self.blocks.get_mut(&block_id)?;
        block.touch(seq);
        self.evictor.touch(block);
        Some(block)
    }

    /// Clear every unpinned block and reset stats. Refuses (returns
    /// false) if any block anywhere in the cache is pinned; the guard
    /// is deliberately whole-cache.
    pub fn reset(&mut self) -> bool {
        if self.blocks.values().any(|b| b.pinned) {
            warn!("Reset refused: pinned blocks present");
            return false;
        }
        self.blocks.clear();
        self.hash_index.clear();
        self.requests.clear();
        self.evictor.clear();
        self.free_ids = (0..self.config.max_blocks).collect();
        self.stats.reset();
        info!("Prefix cache reset");
        true
    }

    /// Current counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Mutable counters, e.g. for `record_preemption` or periodic
    /// `snapshot_and_reset`.
    pub fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    /// The validated configuration.
    pub fn config(&self) -> &PrefixCacheConfig {
        &self.config
    }

    /// Blocks currently cached. `num_cached_blocks + num_free_blocks`
    /// always equals `max_blocks`.
    pub fn num_cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Pool ids available without eviction.
    pub fn num_free_blocks(&self) -> usize {
        self.free_ids.len()
    }

    fn record_lease(&mut self, request_id: &str, block_ids: &[BlockId]) {
        if block_ids.is_empty() {
            return;
        }
        self.requests
            .entry(request_id.to_string())
            .or_default()
            .extend_from_slice(block_ids);
    }

    /// Obtain one block for a full chunk: a shared hit when the chunk
    /// is already cached, otherwise a fresh block (evicting if needed).
    fn acquire_chunk(&mut self, chunk: &[TokenId]) -> Result<BlockId> {
        let hash = hash_token_chunk(chunk, self.config.hash_algorithm);

        let mut collided = false;
        if self.config.enable_sharing {
            if let Some(&block_id) = self.hash_index.get(&hash) {
                let tokens_match = self
                    .blocks
                    .get(&block_id)
                    .is_some_and(|b| b.tokens.as_slice() == chunk);
                if tokens_match {
                    return Ok(self.share_block(block_id));
                }
                // Identical hash, different tokens. Serving the cached
                // block would return wrong KV state; treat as a miss and
                // leave the index entry with its current owner.
                warn!(hash = %hash, block_id, "Block hash collision, falling back to unshared block");
                collided = true;
            }
        }

        self.stats.num_misses += self.config.block_size as u64;
        let block_id = self.reserve_id()?;
        self.clock += 1;
        let block = Block::new(block_id, hash.clone(), chunk.to_vec(), self.clock);
        if self.config.enable_sharing && !collided {
            self.hash_index.insert(hash, block_id);
        }
        self.blocks.insert(block_id, block);
        debug!(block_id, "Cached new block");
        Ok(block_id)
    }

    /// Take another reference on a cached block (a hit).
    fn share_block(&mut self, block_id: BlockId) -> BlockId {
        // A hit makes the block referenced, so it leaves candidacy.
        self.evictor.remove(block_id);
        self.clock += 1;
        let seq = self.clock;
        let pin_shared = self.config.pin_common_prefixes;

        let mut shared = false;
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.ref_count += 1;
            block.touch(seq);
            shared = block.ref_count >= 2;
            if pin_shared && shared {
                block.pinned = true;
            }
        }

        self.stats.num_hits += self.config.block_size as u64;
        if shared {
            self.stats.num_shared_blocks += 1;
        }
        debug!(block_id, "Prefix cache hit");
        block_id
    }

    /// Get a pool id for a new block: from the free pool, else by
    /// evicting. Fails with `CacheFull` when nothing is evictable; the
    /// caller decides whether to queue, reject, or preempt.
    fn reserve_id(&mut self) -> Result<BlockId> {
        if let Some(block_id) = self.free_ids.pop_front() {
            return Ok(block_id);
        }

        let victim = self
            .evictor
            .select_victim()
            .ok_or(CacheError::CacheFull {
                capacity: self.config.max_blocks,
            })?;
        self.evictor.remove(victim);
        if let Some(block) = self.blocks.remove(&victim) {
            // Collision-born blocks are unindexed; only drop the entry
            // if it actually points at the victim.
            if self.hash_index.get(&block.content_hash) == Some(&victim) {
                self.hash_index.remove(&block.content_hash);
            }
        }
        self.stats.num_evictions += 1;
        debug!(block_id = victim, "Evicted block");
        Ok(victim)
    }
}

/// The manager behind a mutex, for callers with multiple workers.
/// All access, reads included, goes through the lock.
pub type SharedPrefixCache = Arc<Mutex<PrefixCacheManager>>;

/// Create a new shared prefix cache.
pub fn new_shared_prefix_cache(config: PrefixCacheConfig) -> Result<SharedPrefixCache> {
    Ok(Arc::new(Mutex::new(PrefixCacheManager::new(config)?)))
}

/// RAII lease over a request's blocks: dropping the lease releases
/// them, so cancellation and error paths cannot leak reference counts.
///
/// Request ids must be unique per live lease.
#[derive(Debug)]
pub struct BlockLease {
    cache: SharedPrefixCache,
    request_id: String,
    block_ids: Vec<BlockId>,
}

impl BlockLease {
    /// Allocate blocks for `token_ids` under `request_id`. On failure
    /// the partial lease is released before the error is returned.
    pub fn acquire(
        cache: &SharedPrefixCache,
        request_id: impl Into<String>,
        token_ids: &[TokenId],
    ) -> Result<Self> {
        let request_id = request_id.into();
        let mut manager = lock(cache);
        match manager.allocate_blocks(&request_id, token_ids) {
            Ok(block_ids) => {
                drop(manager);
                Ok(Self {
                    cache: Arc::clone(cache),
                    request_id,
                    block_ids,
                })
            }
            Err(err) => {
                manager.release_blocks(&request_id);
                Err(err)
            }
        }
    }

    /// The leased block ids, in chunk order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// The request id this lease was acquired under.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        lock(&self.cache).release_blocks(&self.request_id);
    }
}

fn lock(cache: &SharedPrefixCache) -> std::sync::MutexGuard<'_, PrefixCacheManager> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, HashAlgorithm};

    fn config(block_size: usize, max_blocks: usize) -> PrefixCacheConfig {
        PrefixCacheConfig {
            block_size,
            max_blocks,
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_trailing_chunk_not_cached() {
        let mut cache = PrefixCacheManager::new(config(4, 8)).unwrap();
        let blocks = cache.allocate_blocks("r1", &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(cache.stats().num_tokens, 6);
        assert_eq!(cache.stats().num_misses, 4);
    }

    #[test]
    fn test_identical_chunks_share_one_block() {
        let mut cache = PrefixCacheManager::new(config(4, 8)).unwrap();
        let a = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        let b = cache.allocate_blocks("b", &[1, 2, 3, 4]).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.num_cached_blocks(), 1);
        assert_eq!(cache.stats().num_hits, 4);
        assert_eq!(cache.stats().num_shared_blocks, 1);
        assert_eq!(cache.get_block(a[0]).unwrap().ref_count, 2);
    }

    #[test]
    fn test_sharing_disabled_duplicates_blocks() {
        let mut cfg = config(4, 8);
        cfg.enable_sharing = false;
        let mut cache = PrefixCacheManager::new(cfg).unwrap();
        let a = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        let b = cache.allocate_blocks("b", &[1, 2, 3, 4]).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.stats().num_hits, 0);
        assert!(cache.lookup_prefix(&[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_release_floors_at_zero_and_restores_candidacy() {
        let mut cache = PrefixCacheManager::new(config(4, 8)).unwrap();
        let blocks = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        cache.release_blocks("a");
        cache.release_blocks("a"); // unknown now: no-op
        assert_eq!(cache.get_block(blocks[0]).unwrap().ref_count, 0);
        // Released blocks stay cached and are still hit.
        let again = cache.allocate_blocks("b", &[1, 2, 3, 4]).unwrap();
        assert_eq!(again, blocks);
        assert_eq!(cache.stats().num_hits, 4);
    }

    #[test]
    fn test_capacity_pressure_evicts_released_blocks() {
        let mut cache = PrefixCacheManager::new(config(2, 2)).unwrap();
        cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        cache.release_blocks("a");
        // Both blocks freeable; a new request displaces them.
        cache.allocate_blocks("b", &[9, 9, 8, 8]).unwrap();
        assert_eq!(cache.stats().num_evictions, 2);
        assert_eq!(cache.num_cached_blocks(), 2);
        assert!(cache.lookup_prefix(&[1, 2]).is_empty());
    }

    #[test]
    fn test_cache_full_when_nothing_evictable() {
        let mut cache = PrefixCacheManager::new(config(4, 2)).unwrap();
        // Sequence A fills the cache and stays live.
        cache
            .allocate_blocks("a", &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        // B's first chunk hits A's block; its second cannot be placed.
        let err = cache
            .allocate_blocks("b", &[1, 2, 3, 4, 9, 9, 9, 9])
            .unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { capacity: 2 }));

        // Planning still sees exactly one matched block.
        assert_eq!(cache.lookup_prefix(&[1, 2, 3, 4, 9, 9, 9, 9]).len(), 1);

        // The partial lease is recorded; releasing B undoes its hit.
        let shared = cache.lookup_prefix(&[1, 2, 3, 4])[0];
        assert_eq!(cache.get_block(shared).unwrap().ref_count, 2);
        cache.release_blocks("b");
        assert_eq!(cache.get_block(shared).unwrap().ref_count, 1);
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let mut cache = PrefixCacheManager::new(config(2, 4)).unwrap();
        for (i, req) in ["a", "b", "c"].iter().enumerate() {
            let base = (i as i32) * 100;
            let _ = cache.allocate_blocks(req, &[base, base + 1, base + 2, base + 3]);
            assert_eq!(
                cache.num_cached_blocks() + cache.num_free_blocks(),
                4,
                "live + free must equal max_blocks"
            );
        }
        assert!(cache.num_cached_blocks() <= 4);
    }

    #[test]
    fn test_pinned_block_never_evicted() {
        let mut cache = PrefixCacheManager::new(config(2, 1)).unwrap();
        let blocks = cache.allocate_blocks("a", &[1, 2]).unwrap();
        cache.release_blocks("a");
        assert!(cache.pin_block(blocks[0]));

        let err = cache.allocate_blocks("b", &[3, 4]).unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { .. }));

        // Unpinning restores eligibility.
        assert!(cache.unpin_block(blocks[0]));
        cache.allocate_blocks("c", &[3, 4]).unwrap();
        assert_eq!(cache.stats().num_evictions, 1);
    }

    #[test]
    fn test_pin_unknown_block() {
        let mut cache = PrefixCacheManager::new(config(2, 1)).unwrap();
        assert!(!cache.pin_block(42));
        assert!(!cache.unpin_block(42));
        assert!(cache.get_block(42).is_none());
    }

    #[test]
    fn test_pin_common_prefixes_pins_on_sharing() {
        let mut cfg = config(4, 4);
        cfg.pin_common_prefixes = true;
        let mut cache = PrefixCacheManager::new(cfg).unwrap();
        let blocks = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        assert!(!cache.get_block(blocks[0]).unwrap().pinned);
        cache.allocate_blocks("b", &[1, 2, 3, 4]).unwrap();
        assert!(cache.get_block(blocks[0]).unwrap().pinned);
        assert!(!cache.reset());
    }

    #[test]
    fn test_reset_refused_while_any_block_pinned() {
        let mut cache = PrefixCacheManager::new(config(2, 4)).unwrap();
        let a = cache.allocate_blocks("a", &[1, 2]).unwrap();
        cache.allocate_blocks("b", &[3, 4]).unwrap();
        cache.pin_block(a[0]);
        assert!(!cache.reset());

        cache.unpin_block(a[0]);
        assert!(cache.reset());
        assert_eq!(cache.num_cached_blocks(), 0);
        assert_eq!(cache.num_free_blocks(), 4);
        assert_eq!(cache.stats().num_tokens, 0);
    }

    #[test]
    fn test_lookup_prefix_does_not_touch() {
        let mut cache = PrefixCacheManager::new(config(2, 4)).unwrap();
        let blocks = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        let before = cache.blocks[&blocks[0]].access_count;
        let matched = cache.lookup_prefix(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(matched, blocks);
        assert_eq!(cache.blocks[&blocks[0]].access_count, before);
        assert_eq!(cache.blocks[&blocks[0]].ref_count, 1);
    }

    #[test]
    fn test_lookup_prefix_stops_at_first_miss() {
        let mut cache = PrefixCacheManager::new(config(2, 8)).unwrap();
        cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
        // Middle chunk differs: only the first matches.
        assert_eq!(cache.lookup_prefix(&[1, 2, 9, 9, 3, 4]).len(), 1);
        // Trailing partial chunk never matches.
        assert_eq!(cache.lookup_prefix(&[1, 2, 3]).len(), 1);
    }

    #[test]
    fn test_eviction_policies_construct() {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::Fifo,
            EvictionPolicy::Arc,
        ] {
            let mut cfg = config(2, 2);
            cfg.eviction_policy = policy;
            assert!(PrefixCacheManager::new(cfg).is_ok());
        }
    }

    #[test]
    fn test_hash_algorithms_all_share() {
        for algo in [
            HashAlgorithm::Fast64,
            HashAlgorithm::Sha256,
            HashAlgorithm::Md5,
        ] {
            let mut cfg = config(4, 4);
            cfg.hash_algorithm = algo;
            let mut cache = PrefixCacheManager::new(cfg).unwrap();
            let a = cache.allocate_blocks("a", &[1, 2, 3, 4]).unwrap();
            let b = cache.allocate_blocks("b", &[1, 2, 3, 4]).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_block_lease_releases_on_drop() {
        let cache = new_shared_prefix_cache(config(2, 4)).unwrap();
        let block_id = {
            let lease = BlockLease::acquire(&cache, "r1", &[1, 2]).unwrap();
            assert_eq!(lease.block_ids().len(), 1);
            lease.block_ids()[0]
        };
        let mut manager = cache.lock().unwrap();
        assert_eq!(manager.get_block(block_id).unwrap().ref_count, 0);
    }

    #[test]
    fn test_block_lease_failure_releases_partial() {
        let cache = new_shared_prefix_cache(config(4, 2)).unwrap();
        let _a = BlockLease::acquire(&cache, "a", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let err = BlockLease::acquire(&cache, "b", &[1, 2, 3, 4, 9, 9, 9, 9]).unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { .. }));

        // The failed lease took no lasting reference on the shared block.
        let mut manager = cache.lock().unwrap();
        let shared = manager.lookup_prefix(&[1, 2, 3, 4])[0];
        assert_eq!(manager.get_block(shared).unwrap().ref_count, 1);
    }
}
