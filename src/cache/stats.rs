//! Cache hit/miss/eviction/sharing counters.
//!
//! The scheduler polls these for capacity and backpressure decisions.
//! Counters can be exported as a name/value map or as line-oriented
//! text (`name{} value` pairs) for metrics scraping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Running counters for the prefix cache.
///
/// Hit and miss counts are in tokens: each full-chunk hit or miss adds
/// `block_size` to the respective counter, so `hit_rate` reflects the
/// fraction of chunked tokens served from cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Tokens submitted to `allocate_blocks`, including trailing
    /// partial chunks that never reach the cache.
    pub num_tokens: u64,

    /// Tokens served from cached blocks.
    pub num_hits: u64,

    /// Tokens that required a new block.
    pub num_misses: u64,

    /// Blocks reclaimed under capacity pressure.
    pub num_evictions: u64,

    /// Hits that left a block with two or more owners.
    pub num_shared_blocks: u64,

    /// Requests preempted by the scheduler (reported in, not derived).
    pub preempted: u64,
}

impl CacheStats {
    /// Fraction of chunked tokens served from cache; 0 with no samples.
    pub fn hit_rate(&self) -> f64 {
        let total = self.num_hits + self.num_misses;
        if total == 0 {
            return 0.0;
        }
        self.num_hits as f64 / total as f64
    }

    /// Record a scheduler-initiated preemption.
    pub fn record_preemption(&mut self) {
        self.preempted += 1;
    }

    /// Return the current counters and reset them to zero, for periodic
    /// reporting.
    pub fn snapshot_and_reset(&mut self) -> CacheStats {
        std::mem::take(self)
    }

    /// Reset all counters to zero.
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }

    /// Counters plus the derived hit rate, as a name/value mapping.
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("num_tokens", self.num_tokens as f64),
            ("num_hits", self.num_hits as f64),
            ("num_misses", self.num_misses as f64),
            ("num_evictions", self.num_evictions as f64),
            ("num_shared_blocks", self.num_shared_blocks as f64),
            ("hit_rate", self.hit_rate()),
            ("preempted", self.preempted as f64),
        ])
    }

    /// Line-oriented text export: one `name{} value` pair per line,
    /// prefixed for scrape-time namespacing.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.to_map() {
            out.push_str(&format!("prefix_cache_{name}{{}} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_samples() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            num_hits: 48,
            num_misses: 16,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let mut stats = CacheStats {
            num_tokens: 100,
            num_hits: 32,
            ..Default::default()
        };
        let snap = stats.snapshot_and_reset();
        assert_eq!(snap.num_tokens, 100);
        assert_eq!(snap.num_hits, 32);
        assert_eq!(stats, CacheStats::default());
    }

    #[test]
    fn test_map_has_all_keys() {
        let map = CacheStats::default().to_map();
        for key in [
            "num_tokens",
            "num_hits",
            "num_misses",
            "num_evictions",
            "num_shared_blocks",
            "hit_rate",
            "preempted",
        ] {
            assert!(map.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_text_export_format() {
        let mut stats = CacheStats::default();
        stats.num_hits = 48;
        stats.num_misses = 16;
        let text = stats.render_text();
        assert!(text.contains("prefix_cache_num_hits{} 48\n"));
        assert!(text.contains("prefix_cache_hit_rate{} 0.75\n"));
        assert_eq!(text.lines().count(), 7);
    }
}
