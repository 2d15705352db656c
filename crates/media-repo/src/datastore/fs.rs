//! Filesystem-backed content-addressed datastore.
//!
//! Blobs live in a git-style sharded layout under the store root:
//! `<base>/<first 2 hex chars>/<remaining 62 hex chars>`, which is also the location recorded
//! on media records. Writes stream into a temp file under `<base>/.tmp` while hashing, then
//! rename into place, so concurrent writers of identical content converge on one file and a
//! crashed write never leaves a partial blob at its final path.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::datastore::Datastore;
use crate::error::{RepoError, RepoResult};
use crate::model::{ByteStream, StoredBlob};

const WRITE_CHUNK_BYTES: usize = 64 * 1024;

pub struct FsDatastore {
    id: String,
    base_path: PathBuf,
    max_size: Option<u64>,
}

impl FsDatastore {
    pub async fn create(
        id: impl Into<String>,
        base_path: PathBuf,
        max_size: Option<u64>,
    ) -> RepoResult<Self> {
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(base_path.join(".tmp")).await?;
        let id = id.into();
        debug!(id, path = %base_path.display(), "filesystem datastore ready");
        Ok(Self {
            id,
            base_path,
            max_size,
        })
    }

    fn blob_path(&self, location: &str) -> RepoResult<PathBuf> {
        let relative = Path::new(location);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.is_absolute() {
            return Err(RepoError::internal(format!(
                "datastore location '{location}' escapes the store root"
            )));
        }
        Ok(self.base_path.join(relative))
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path.join(".tmp").join(Uuid::new_v4().to_string())
    }
}

fn sharded_location(sha256_hex: &str) -> String {
    format!("{}/{}", &sha256_hex[..2], &sha256_hex[2..])
}

#[async_trait]
impl Datastore for FsDatastore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, ctx: &CancellationToken, location: &str) -> RepoResult<ByteStream> {
        if ctx.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        let path = self.blob_path(location)?;
        let file = tokio::select! {
            biased;
            res = fs::File::open(&path) => res?,
            _ = ctx.cancelled() => return Err(RepoError::Cancelled),
        };
        Ok(Box::new(BufReader::new(file)))
    }

    async fn put(&self, mut stream: ByteStream) -> RepoResult<StoredBlob> {
        let temp_path = self.temp_path();
        let mut temp_file = fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;
        let mut buf = vec![0u8; WRITE_CHUNK_BYTES];

        loop {
            let read = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    drop(temp_file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err.into());
                }
            };

            total_bytes += read as u64;
            if let Some(limit) = self.max_size {
                if total_bytes > limit {
                    drop(temp_file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(RepoError::SizeLimit {
                        actual: total_bytes,
                        limit,
                    });
                }
            }

            hasher.update(&buf[..read]);
            if let Err(err) = temp_file.write_all(&buf[..read]).await {
                drop(temp_file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
        }

        temp_file.flush().await?;
        drop(temp_file);

        let sha256_hex = hex::encode(hasher.finalize());
        let location = sharded_location(&sha256_hex);
        let blob_path = self.base_path.join(&location);

        if fs::try_exists(&blob_path).await? {
            // identical content already stored
            let _ = fs::remove_file(&temp_path).await;
        } else {
            if let Some(parent) = blob_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            if let Err(err) = fs::rename(&temp_path, &blob_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
        }

        debug!(id = %self.id, location, size = total_bytes, "stored blob");
        Ok(StoredBlob {
            location,
            sha256_hex,
            size_bytes: total_bytes,
        })
    }
}
