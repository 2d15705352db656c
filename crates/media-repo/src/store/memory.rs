//! In-memory metadata store for embedding and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::RepoResult;
use crate::model::MediaRecord;
use crate::store::MetadataStore;

#[derive(Default)]
pub struct MemoryMetadataStore {
    media: Mutex<HashMap<(String, String), MediaRecord>>,
    last_access: Mutex<HashMap<String, i64>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded access for a content hash, if any.
    pub fn last_access(&self, sha256_hash: &str) -> Option<i64> {
        self.last_access
            .lock()
            .expect("last access lock poisoned")
            .get(sha256_hash)
            .copied()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.media.lock().expect("media lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_media(&self, origin: &str, media_id: &str) -> RepoResult<Option<MediaRecord>> {
        let media = self.media.lock().expect("media lock poisoned");
        Ok(media.get(&(origin.to_string(), media_id.to_string())).cloned())
    }

    async fn insert_media(&self, record: &MediaRecord) -> RepoResult<()> {
        let mut media = self.media.lock().expect("media lock poisoned");
        media
            .entry((record.origin.clone(), record.media_id.clone()))
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn set_quarantined(
        &self,
        origin: &str,
        media_id: &str,
        quarantined: bool,
    ) -> RepoResult<bool> {
        let mut media = self.media.lock().expect("media lock poisoned");
        match media.get_mut(&(origin.to_string(), media_id.to_string())) {
            Some(record) => {
                record.quarantined = quarantined;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_last_access(&self, sha256_hash: &str, now_ms: i64) -> RepoResult<()> {
        let mut last_access = self.last_access.lock().expect("last access lock poisoned");
        let entry = last_access.entry(sha256_hash.to_string()).or_insert(now_ms);
        *entry = (*entry).max(now_ms);
        Ok(())
    }
}
