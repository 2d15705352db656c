//! SQLite-backed metadata store.
//!
//! The connection is shared behind a mutex and every call goes through `spawn_blocking`, so
//! the async runtime never blocks on SQLite I/O. Callers that need cancellation get it at the
//! await point; the underlying statement runs to completion either way.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{RepoError, RepoResult};
use crate::model::MediaRecord;
use crate::store::MetadataStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS media (
    origin TEXT NOT NULL,
    media_id TEXT NOT NULL,
    sha256_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    upload_name TEXT NOT NULL,
    datastore_id TEXT NOT NULL,
    location TEXT NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0,
    upload_ts_ms INTEGER NOT NULL,
    PRIMARY KEY (origin, media_id)
);
CREATE INDEX IF NOT EXISTS idx_media_sha256 ON media (sha256_hash);

CREATE TABLE IF NOT EXISTS last_access (
    sha256_hash TEXT PRIMARY KEY,
    last_access_ts_ms INTEGER NOT NULL
);
";

impl From<rusqlite::Error> for RepoError {
    fn from(err: rusqlite::Error) -> Self {
        RepoError::StorageUnavailable(format!("sqlite: {err}"))
    }
}

pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: &Path) -> RepoResult<Self> {
        debug!(path = %path.display(), "opening metadata database");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> RepoResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> RepoResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Last recorded access for a content hash, if any.
    pub async fn last_access(&self, sha256_hash: &str) -> RepoResult<Option<i64>> {
        let conn = Arc::clone(&self.conn);
        let sha256_hash = sha256_hash.to_string();
        run_blocking(move || {
            let conn = conn.lock().expect("sqlite connection lock poisoned");
            match conn.query_row(
                "SELECT last_access_ts_ms FROM last_access WHERE sha256_hash = ?1",
                params![sha256_hash],
                |row| row.get(0),
            ) {
                Ok(ts) => Ok(Some(ts)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> RepoResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RepoResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RepoError::internal(format!("metadata store task failed: {e}")))?
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRecord> {
    let quarantined: i32 = row.get(8)?;
    Ok(MediaRecord {
        origin: row.get(0)?,
        media_id: row.get(1)?,
        sha256_hash: row.get(2)?,
        size_bytes: row.get(3)?,
        content_type: row.get(4)?,
        upload_name: row.get(5)?,
        datastore_id: row.get(6)?,
        location: row.get(7)?,
        quarantined: quarantined != 0,
        upload_ts_ms: row.get(9)?,
    })
}

const RECORD_COLUMNS: &str = "origin, media_id, sha256_hash, size_bytes, content_type, \
     upload_name, datastore_id, location, quarantined, upload_ts_ms";

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_media(&self, origin: &str, media_id: &str) -> RepoResult<Option<MediaRecord>> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        let media_id = media_id.to_string();
        run_blocking(move || {
            let conn = conn.lock().expect("sqlite connection lock poisoned");
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM media WHERE origin = ?1 AND media_id = ?2"
            );
            match conn.query_row(&sql, params![origin, media_id], row_to_record) {
                Ok(record) => Ok(Some(record)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn insert_media(&self, record: &MediaRecord) -> RepoResult<()> {
        let conn = Arc::clone(&self.conn);
        let record = record.clone();
        run_blocking(move || {
            let conn = conn.lock().expect("sqlite connection lock poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO media (origin, media_id, sha256_hash, size_bytes, \
                 content_type, upload_name, datastore_id, location, quarantined, upload_ts_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.origin,
                    record.media_id,
                    record.sha256_hash,
                    record.size_bytes,
                    record.content_type,
                    record.upload_name,
                    record.datastore_id,
                    record.location,
                    record.quarantined as i32,
                    record.upload_ts_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_quarantined(
        &self,
        origin: &str,
        media_id: &str,
        quarantined: bool,
    ) -> RepoResult<bool> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        let media_id = media_id.to_string();
        run_blocking(move || {
            let conn = conn.lock().expect("sqlite connection lock poisoned");
            let affected = conn.execute(
                "UPDATE media SET quarantined = ?3 WHERE origin = ?1 AND media_id = ?2",
                params![origin, media_id, quarantined as i32],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn upsert_last_access(&self, sha256_hash: &str, now_ms: i64) -> RepoResult<()> {
        let conn = Arc::clone(&self.conn);
        let sha256_hash = sha256_hash.to_string();
        run_blocking(move || {
            let conn = conn.lock().expect("sqlite connection lock poisoned");
            conn.execute(
                "INSERT INTO last_access (sha256_hash, last_access_ts_ms) VALUES (?1, ?2) \
                 ON CONFLICT(sha256_hash) DO UPDATE SET \
                 last_access_ts_ms = MAX(last_access_ts_ms, excluded.last_access_ts_ms)",
                params![sha256_hash, now_ms],
            )?;
            Ok(())
        })
        .await
    }
}
