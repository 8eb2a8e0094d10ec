//! Attention computation over paged KV storage.
//!
//! - [`metadata`]: per-batch tensor assembly bridging cache state to
//!   the compute kernel
//! - [`ops`]: scaled-dot-product attention, paged attention (whole
//!   gather and partitioned streaming-softmax), GQA expansion

pub mod metadata;
pub mod ops;
