//! Persistent metadata storage.
//!
//! [`MetadataStore`] is the seam between the download core and whatever relational store a
//! deployment runs. Two implementations ship here: [`SqliteMetadataStore`] for real
//! persistence and [`MemoryMetadataStore`] for embedding and tests.

use async_trait::async_trait;

use crate::error::RepoResult;
use crate::model::MediaRecord;

mod memory;
mod sqlite;

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

/// Lookup and bookkeeping operations over persisted media records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the record for `(origin, media_id)`.
    ///
    /// `Ok(None)` is the no-rows sentinel; lookup failures are errors.
    async fn get_media(&self, origin: &str, media_id: &str) -> RepoResult<Option<MediaRecord>>;

    /// Persist a new record. Inserting an identity that already exists is a no-op: records
    /// are immutable after creation, so a racing duplicate insert carries the same data.
    async fn insert_media(&self, record: &MediaRecord) -> RepoResult<()>;

    /// Flip the one mutable field. Returns whether a record existed.
    async fn set_quarantined(
        &self,
        origin: &str,
        media_id: &str,
        quarantined: bool,
    ) -> RepoResult<bool>;

    /// Record an access for a content hash. The stored timestamp never moves backwards.
    async fn upsert_last_access(&self, sha256_hash: &str, now_ms: i64) -> RepoResult<()>;
}
