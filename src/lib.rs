//! kv-prefix-cache: content-addressable KV prefix cache and paged
//! attention core for LLM serving.
//!
//! Independent requests sharing an identical token prefix (a common
//! system prompt, say) reuse previously computed key/value state:
//! token ids are chunked into fixed-size blocks, each full chunk is
//! content-hashed, and identical chunks share one reference-counted
//! physical block. The paged store and attention kernels then operate
//! on that shared state through per-sequence block tables.
//!
//! The crate is synchronous and CPU/memory-bound. The cache types are
//! not internally thread-safe; multi-worker callers serialize access
//! behind [`cache::prefix::SharedPrefixCache`]. Attention compute over
//! independent sequences shares no mutable state and may be
//! parallelized freely by the caller.

pub mod attention;
pub mod cache;
pub mod config;
pub mod error;

pub use attention::metadata::AttentionMetadata;
pub use attention::ops::{
    expand_kv_for_gqa, paged_attention_v1, paged_attention_v2, scaled_dot_product_attention,
};
pub use cache::allocator::BlockAllocator;
pub use cache::block::{Block, BlockId, BlockTable, TokenId};
pub use cache::prefix::{new_shared_prefix_cache, BlockLease, PrefixCacheManager, SharedPrefixCache};
pub use cache::stats::CacheStats;
pub use cache::store::PagedKVCache;
pub use config::{AttentionConfig, EvictionPolicy, HashAlgorithm, PrefixCacheConfig};
pub use error::{CacheError, Result};
