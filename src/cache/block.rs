//! KV block types, per-sequence block tables, and content hashing.
//!
//! A block holds a fixed number of token positions' worth of KV state.
//! Blocks are the unit of content addressing: a block is created for a
//! previously unseen full chunk of tokens, shared (ref_count incremented)
//! when an identical chunk is requested again, and reclaimed by the
//! eviction policy once no live request references it.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::config::HashAlgorithm;

/// Unique identifier for a physical block. Ids are pool indices in
/// `0..max_blocks`, so `block_id * block_size + offset` addresses a slot
/// in the paged KV store directly.
pub type BlockId = usize;

/// A token id. Serialized as little-endian `i32` for hashing.
pub type TokenId = i32;

/// Compute the content hash of one full token chunk.
///
/// The ordered token ids are serialized as fixed-width little-endian
/// signed integers and hashed with the configured algorithm.
/// Cryptographic digests are truncated to 16 hex characters; the fast
/// 64-bit hash uses its full 16-hex-digit digest.
pub fn hash_token_chunk(tokens: &[TokenId], algorithm: HashAlgorithm) -> String {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for &token in tokens {
        bytes.extend_from_slice(&token.to_le_bytes());
    }

    match algorithm {
        HashAlgorithm::Fast64 => {
            let mut hasher = DefaultHasher::new();
            bytes.hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        }
        HashAlgorithm::Sha256 => {
            let digest = Sha256::digest(&bytes);
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            hex[..16].to_string()
        }
        HashAlgorithm::Md5 => {
            let digest = Md5::digest(&bytes);
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            hex[..16].to_string()
        }
    }
}

/// A single cached KV block.
///
/// The block keeps its exact token ids alongside the content hash so a
/// hit can verify the tokens before reusing cached state (a bare hash
/// match could silently return wrong KV data on collision).
#[derive(Debug, Clone)]
pub struct Block {
    /// Pool index of this block.
    pub id: BlockId,

    /// Content hash of the token chunk this block caches.
    pub content_hash: String,

    /// The exact ordered token ids, `block_size` of them.
    pub tokens: Vec<TokenId>,

    /// Number of live requests referencing this block.
    pub ref_count: usize,

    /// Pinned blocks are exempt from eviction.
    pub pinned: bool,

    /// Number of times this block has been read or hit.
    pub access_count: u64,

    /// Timestamp of last access (observability; ordering uses the
    /// monotonic sequence numbers below).
    pub last_access: Instant,

    /// Monotonic sequence number of the last access.
    pub last_access_seq: u64,

    /// Monotonic sequence number assigned at insertion.
    pub insert_seq: u64,
}

impl Block {
    /// Create a block for a freshly cached chunk, owned by one request.
    pub fn new(
        id: BlockId,
        content_hash: String,
        tokens: Vec<TokenId>,
        insert_seq: u64,
    ) -> Self {
        Self {
            id,
            content_hash,
            tokens,
            ref_count: 1,
            pinned: false,
            access_count: 0,
            last_access: Instant::now(),
            last_access_seq: insert_seq,
            insert_seq,
        }
    }

    /// Record an access, updating the timestamp, counter, and access
    /// sequence number.
    pub fn touch(&mut self, access_seq: u64) {
        self.last_access = Instant::now();
        self.last_access_seq = access_seq;
        self.access_count += 1;
    }

    /// A block is evictable iff nothing references it and it is not pinned.
    pub fn is_evictable(&self) -> bool {
        self.ref_count == 0 && !self.pinned
    }
}

/// Ordered list of block ids covering one sequence's token chunks.
///
/// Owned exclusively by the allocator (or cache manager) for the
/// lifetime of the request.
#[derive(Debug, Clone)]
pub struct BlockTable {
    /// Sequence / request this table belongs to.
    pub seq_id: u64,

    /// Block ids in chunk order: `blocks[i]` covers tokens
    /// `[i * block_size, (i+1) * block_size)`.
    pub blocks: Vec<BlockId>,

    /// Tokens per block.
    pub block_size: usize,
}

impl BlockTable {
    /// Create an empty table.
    pub fn new(seq_id: u64, block_size: usize) -> Self {
        Self {
            seq_id,
            blocks: Vec::new(),
            block_size,
        }
    }

    /// Append a block to the end of the sequence.
    pub fn push(&mut self, block_id: BlockId) {
        self.blocks.push(block_id);
    }

    /// Block id covering a token position, if mapped.
    pub fn block_for_token(&self, token_pos: usize) -> Option<BlockId> {
        self.blocks.get(token_pos / self.block_size).copied()
    }

    /// Number of blocks in this table.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
