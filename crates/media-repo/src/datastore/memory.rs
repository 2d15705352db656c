//! In-memory datastore for embedding and tests.
//!
//! Content-addressed like the filesystem backend: the location of a stored blob is its full
//! hex hash.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::datastore::Datastore;
use crate::error::{RepoError, RepoResult};
use crate::model::{buffered_stream, ByteStream, StoredBlob};

pub struct MemoryDatastore {
    id: String,
    max_size: Option<u64>,
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryDatastore {
    pub fn new(id: impl Into<String>, max_size: Option<u64>) -> Self {
        Self {
            id: id.into(),
            max_size,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, ctx: &CancellationToken, location: &str) -> RepoResult<ByteStream> {
        if ctx.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        let blobs = self.blobs.lock().expect("blob map lock poisoned");
        match blobs.get(location) {
            Some(contents) => Ok(buffered_stream(contents.clone())),
            None => Err(RepoError::StorageUnavailable(format!(
                "no blob at location '{location}'"
            ))),
        }
    }

    async fn put(&self, mut stream: ByteStream) -> RepoResult<StoredBlob> {
        let mut contents = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            contents.extend_from_slice(&buf[..read]);
            if let Some(limit) = self.max_size {
                if contents.len() as u64 > limit {
                    return Err(RepoError::SizeLimit {
                        actual: contents.len() as u64,
                        limit,
                    });
                }
            }
        }

        let sha256_hex = hex::encode(Sha256::digest(&contents));
        let size_bytes = contents.len() as u64;
        self.blobs
            .lock()
            .expect("blob map lock poisoned")
            .insert(sha256_hex.clone(), Bytes::from(contents));

        Ok(StoredBlob {
            location: sha256_hex.clone(),
            sha256_hex,
            size_bytes,
        })
    }
}
