//! Runtime configuration for kv-prefix-cache.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All knobs are validated at construction time:
//! an invalid `block_size` or `max_blocks` fails fast instead of
//! surfacing as a corrupt slot mapping later.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Which block to reclaim when the cache is at capacity and a new
/// block is needed. Only freeable blocks (`ref_count == 0` and not
/// pinned) are ever candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used; ties broken by insertion order.
    Lru,
    /// Least frequently used; ties broken by first encountered.
    Lfu,
    /// Oldest inserted.
    Fifo,
    /// Simplified ARC: among the 10 least-recently-used candidates,
    /// pick the lowest access frequency.
    Arc,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
            EvictionPolicy::Arc => write!(f, "arc"),
        }
    }
}

/// Algorithm used to hash a full token chunk into a block content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Non-cryptographic 64-bit hash (default). Full 16-hex-digit digest.
    Fast64,
    /// SHA-256, hex digest truncated to 16 characters.
    Sha256,
    /// MD5, hex digest truncated to 16 characters.
    Md5,
}

/// Prefix cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixCacheConfig {
    /// Tokens per block. Only full `block_size` chunks participate in
    /// content addressing.
    pub block_size: usize,

    /// Total number of physical blocks. The cache never exceeds this.
    pub max_blocks: usize,

    /// Eviction policy applied under capacity pressure.
    pub eviction_policy: EvictionPolicy,

    /// Whether identical chunks may share a block across requests.
    pub enable_sharing: bool,

    /// Pin a block once a hit proves it backs a common prefix
    /// (its ref_count reaches 2).
    pub pin_common_prefixes: bool,

    /// Content hash algorithm.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for PrefixCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            max_blocks: 1024,
            eviction_policy: EvictionPolicy::Lru,
            enable_sharing: true,
            pin_common_prefixes: false,
            hash_algorithm: HashAlgorithm::Fast64,
        }
    }
}

impl PrefixCacheConfig {
    /// Validate the configuration, rejecting values that would corrupt
    /// slot arithmetic or make the cache unusable.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CacheError::Configuration(
                "block_size must be positive".to_string(),
            ));
        }
        if self.max_blocks == 0 {
            return Err(CacheError::Configuration(
                "max_blocks must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a JSON file, falling back to defaults if
    /// the file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Per-model attention parameters. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Dimension of each attention head.
    pub head_size: usize,

    /// Number of query heads.
    pub num_heads: usize,

    /// Number of KV heads (GQA/MQA). Defaults to `num_heads`.
    pub num_kv_heads: usize,

    /// Tokens per KV block.
    pub block_size: usize,

    /// Softmax scale. Defaults to `1/sqrt(head_size)`.
    pub scale: f32,

    /// Optional sliding window: a query may not attend to keys more
    /// than this many positions behind it.
    pub sliding_window: Option<usize>,
}

impl AttentionConfig {
    /// Default tokens per block when not overridden.
    pub const DEFAULT_BLOCK_SIZE: usize = 16;

    /// Build a config with defaults for `num_kv_heads`, `block_size`,
    /// and `scale`. Fields are public; call [`validate`](Self::validate)
    /// again after adjusting them.
    pub fn new(head_size: usize, num_heads: usize) -> Result<Self> {
        let config = Self {
            head_size,
            num_heads,
            num_kv_heads: num_heads,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            scale: 1.0 / (head_size as f32).sqrt(),
            sliding_window: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate head geometry and block size.
    pub fn validate(&self) -> Result<()> {
        if self.head_size == 0 {
            return Err(CacheError::Configuration(
                "head_size must be positive".to_string(),
            ));
        }
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(CacheError::Configuration(
                "num_heads and num_kv_heads must be positive".to_string(),
            ));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(CacheError::Configuration(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.block_size == 0 {
            return Err(CacheError::Configuration(
                "block_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// How many query heads share each KV head.
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Flattened KV row width: `num_kv_heads * head_size`.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefix_config_is_valid() {
        let cfg = PrefixCacheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.block_size, 16);
        assert_eq!(cfg.eviction_policy, EvictionPolicy::Lru);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let cfg = PrefixCacheConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(CacheError::Configuration(_))));
    }

    #[test]
    fn test_zero_max_blocks_rejected() {
        let cfg = PrefixCacheConfig {
            max_blocks: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_attention_defaults() {
        let cfg = AttentionConfig::new(128, 32).unwrap();
        assert_eq!(cfg.num_kv_heads, 32);
        assert_eq!(cfg.block_size, 16);
        assert!((cfg.scale - 1.0 / (128.0f32).sqrt()).abs() < 1e-7);
        assert_eq!(cfg.num_queries_per_kv(), 1);
    }

    #[test]
    fn test_gqa_geometry() {
        let mut cfg = AttentionConfig::new(64, 32).unwrap();
        cfg.num_kv_heads = 8;
        cfg.validate().unwrap();
        assert_eq!(cfg.num_queries_per_kv(), 4);
        assert_eq!(cfg.kv_dim(), 512);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut cfg = AttentionConfig::new(64, 10).unwrap();
        cfg.num_kv_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_policy_serde_lowercase() {
        let json = serde_json::to_string(&EvictionPolicy::Arc).unwrap();
        assert_eq!(json, "\"arc\"");
        let algo: HashAlgorithm = serde_json::from_str("\"sha256\"").unwrap();
        assert_eq!(algo, HashAlgorithm::Sha256);
    }
}
