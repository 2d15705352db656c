//! Content-addressed blob cache and download counters.
//!
//! Entries are keyed by SHA-256, so distinct records describing identical bytes share one
//! entry. The promotion/eviction policy feeding the cache lives outside the download path;
//! the path here only probes, and tolerates an entry disappearing between probe and use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RepoResult;
use crate::model::{CachedEntry, MediaRecord};

/// Injected handle for the content cache. Implementations must be concurrent-safe.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Look up fully-buffered contents for a record, keyed by its content hash.
    ///
    /// A probe failure is an error, not a miss: an off-heap implementation that cannot answer
    /// may be holding quarantine-relevant content, so the caller must not fall back silently.
    async fn get_media(&self, record: &MediaRecord) -> RepoResult<Option<CachedEntry>>;

    /// Record one served download for the given content hash.
    fn increment_downloads(&self, sha256_hash: &str);

    /// Downloads recorded so far for the given content hash.
    fn download_count(&self, sha256_hash: &str) -> u64;
}

/// In-memory, process-wide content cache.
#[derive(Default)]
pub struct MemoryContentCache {
    entries: Mutex<HashMap<String, Bytes>>,
    downloads: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl MemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store buffered contents under a content hash. Called by whatever promotion policy
    /// feeds this cache.
    pub fn insert(&self, sha256_hash: &str, contents: Bytes) {
        self.entries
            .lock()
            .expect("content cache lock poisoned")
            .insert(sha256_hash.to_string(), contents);
    }

    /// Drop the entry for a content hash, if present.
    pub fn evict(&self, sha256_hash: &str) {
        self.entries
            .lock()
            .expect("content cache lock poisoned")
            .remove(sha256_hash);
    }

    fn counter(&self, sha256_hash: &str) -> Arc<AtomicU64> {
        let mut downloads = self
            .downloads
            .lock()
            .expect("download counter lock poisoned");
        Arc::clone(
            downloads
                .entry(sha256_hash.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }
}

#[async_trait]
impl ContentCache for MemoryContentCache {
    async fn get_media(&self, record: &MediaRecord) -> RepoResult<Option<CachedEntry>> {
        let entries = self.entries.lock().expect("content cache lock poisoned");
        Ok(entries
            .get(&record.sha256_hash)
            .cloned()
            .map(|contents| CachedEntry { contents }))
    }

    fn increment_downloads(&self, sha256_hash: &str) {
        self.counter(sha256_hash).fetch_add(1, Ordering::Relaxed);
    }

    fn download_count(&self, sha256_hash: &str) -> u64 {
        let downloads = self
            .downloads
            .lock()
            .expect("download counter lock poisoned");
        downloads
            .get(sha256_hash)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
