//! Block cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: Block, BlockTable, content hashing
//! - [`allocator`]: fixed-pool block allocation per sequence
//! - [`slot`]: logical position → physical slot mapping
//! - [`store`]: paged FP16 key/value storage
//! - [`evictor`]: eviction candidate index (LRU/LFU/FIFO/ARC)
//! - [`prefix`]: content-addressable prefix cache manager
//! - [`stats`]: hit/miss/eviction/sharing counters

pub mod allocator;
pub mod block;
pub mod evictor;
pub mod prefix;
pub mod slot;
pub mod stats;
pub mod store;
