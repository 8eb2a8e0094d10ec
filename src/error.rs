//! Error taxonomy for the cache and attention subsystems.
//!
//! `OutOfBlocks` and `CacheFull` are expected operational conditions the
//! caller reacts to (queue, reject, or preempt); `Configuration` and
//! `ShapeMismatch` indicate caller bugs and surface at construction or
//! call time.

use thiserror::Error;

/// Errors produced by the cache and attention subsystems.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The block pool has no free block left. Raised by the plain
    /// allocator, which never evicts.
    #[error("block pool exhausted ({capacity} blocks, all allocated)")]
    OutOfBlocks { capacity: usize },

    /// The cache is at capacity and every block is referenced or
    /// pinned, so nothing can be evicted.
    #[error("cache full ({capacity} blocks, none evictable)")]
    CacheFull { capacity: usize },

    /// A configuration value that would corrupt slot arithmetic or make
    /// the cache unusable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Tensor or mapping dimensions that violate the call contract.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, CacheError>;
