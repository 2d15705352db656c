//! Short-TTL hot cache for media metadata records.
//!
//! Maps `origin/media_id` to the most recently resolved [`MediaRecord`]. Entries expire on a
//! TTL; a sweep task runs the cache's pending maintenance so expirations stay prompt even when
//! reads are sparse. Writes are best-effort and there is no negative caching: absence of an
//! entry never implies the media does not exist.

use std::time::Duration;

use moka::sync::Cache;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::model::{media_cache_key, MediaRecord};

/// Process-wide, concurrent-safe hot metadata cache. Cheap to clone.
#[derive(Clone)]
pub struct HotMediaCache {
    cache: Cache<String, MediaRecord>,
}

impl HotMediaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Spawn the periodic maintenance task. The handle's owner decides its lifetime.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.run_pending_tasks();
                trace!(entries = cache.entry_count(), "hot cache sweep");
            }
        })
    }

    pub fn get(&self, origin: &str, media_id: &str) -> Option<MediaRecord> {
        self.cache.get(&media_cache_key(origin, media_id))
    }

    pub fn insert(&self, record: &MediaRecord) {
        self.cache.insert(record.cache_key(), record.clone());
    }
}

impl std::fmt::Debug for HotMediaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotMediaCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
