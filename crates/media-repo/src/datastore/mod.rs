//! Pluggable blob datastores.
//!
//! A [`Datastore`] is addressed by `(datastore_id, location)`: the id picks a backend out of
//! the [`DatastoreMap`], the location is opaque to the core and meaningful to the backend.
//! The download path only opens streams; the remote fetcher also persists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{RepoError, RepoResult};
use crate::model::{ByteStream, StoredBlob};

mod fs;
mod memory;

pub use fs::FsDatastore;
pub use memory::MemoryDatastore;

/// A single blob backend.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Identifier media records reference this backend by.
    fn id(&self) -> &str;

    /// Open a readable stream over the blob at `location`. Honors `ctx` for its own I/O.
    async fn open(&self, ctx: &CancellationToken, location: &str) -> RepoResult<ByteStream>;

    /// Persist a blob, consuming the stream, and report where it landed plus its hash and
    /// size. Implementations enforce their own size limit while streaming.
    async fn put(&self, stream: ByteStream) -> RepoResult<StoredBlob>;
}

/// Registry resolving datastore ids to handles.
#[derive(Default)]
pub struct DatastoreMap {
    stores: HashMap<String, Arc<dyn Datastore>>,
}

impl DatastoreMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: Arc<dyn Datastore>) {
        self.stores.insert(store.id().to_string(), store);
    }

    /// Resolve a datastore id. An unknown id means a record references a backend this
    /// deployment does not run, which is an internal inconsistency rather than a miss.
    pub fn get(&self, datastore_id: &str) -> RepoResult<Arc<dyn Datastore>> {
        self.stores.get(datastore_id).cloned().ok_or_else(|| {
            RepoError::internal(format!("unknown datastore id '{datastore_id}'"))
        })
    }

    /// Open a stream through the backend that `datastore_id` names.
    pub async fn open(
        &self,
        ctx: &CancellationToken,
        datastore_id: &str,
        location: &str,
    ) -> RepoResult<ByteStream> {
        self.get(datastore_id)?.open(ctx, location).await
    }
}

impl std::fmt::Debug for DatastoreMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreMap")
            .field("ids", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
