//! Caching layers for the download path.
//!
//! Two distinct caches with different keys and lifetimes:
//! - [`hot`]: a short-TTL map from `origin/media_id` to the full metadata record, eliding
//!   repeated metadata-store hits for hot items.
//! - [`content`]: a content-addressed cache of fully-buffered blob bytes, keyed by SHA-256,
//!   plus the per-hash download counters.

pub mod content;
pub mod hot;

pub use content::{ContentCache, MemoryContentCache};
pub use hot::HotMediaCache;
