//! Core data model shared across the crate.
//!
//! The stream currency is [`ByteStream`], a boxed [`AsyncRead`]: every producer (datastore,
//! remote transport, buffered cache hit) hands out the same shape, and the fan-out layer can
//! clone it for coalesced callers without caring where the bytes come from.

use std::fmt;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::RepoError;

/// A single-consumer readable byte source.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Wrap fully-buffered bytes as a [`ByteStream`].
pub fn buffered_stream(contents: Bytes) -> ByteStream {
    Box::new(Cursor::new(contents))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A persisted media record.
///
/// Identity key is `(origin, media_id)`. Records are immutable after creation except for
/// `quarantined`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    /// Homeserver name that minted the media identifier.
    pub origin: String,
    /// Opaque identifier, unique per origin.
    pub media_id: String,
    /// Lowercase hex SHA-256 of the blob contents.
    pub sha256_hash: String,
    /// Blob size in bytes.
    pub size_bytes: i64,
    /// MIME type reported at upload time.
    pub content_type: String,
    /// Original upload filename; may be empty.
    pub upload_name: String,
    /// Which datastore holds the blob.
    pub datastore_id: String,
    /// Backend-specific blob location, opaque to the core.
    pub location: String,
    /// Administrative flag preventing the bytes from being served.
    pub quarantined: bool,
    /// Upload time in milliseconds since the Unix epoch.
    pub upload_ts_ms: i64,
}

impl MediaRecord {
    /// Key used by the hot metadata cache.
    pub fn cache_key(&self) -> String {
        media_cache_key(&self.origin, &self.media_id)
    }
}

/// Hot-cache key for `(origin, media_id)`.
pub fn media_cache_key(origin: &str, media_id: &str) -> String {
    format!("{origin}/{media_id}")
}

/// The per-response view handed to callers: identity, headers-worth of metadata, and a stream.
pub struct MinimalMedia {
    pub origin: String,
    pub media_id: String,
    pub content_type: String,
    pub upload_name: String,
    /// Blob size, or `-1` when unknown (live remote stream without a finalized record).
    pub size_bytes: i64,
    /// The byte source. `None` until the orchestrator attaches one.
    pub stream: Option<ByteStream>,
    /// The full record, when resolution produced one.
    pub known_record: Option<MediaRecord>,
}

impl MinimalMedia {
    /// Build a view from a full record, with the stream left unset.
    pub fn from_record(record: MediaRecord) -> Self {
        Self {
            origin: record.origin.clone(),
            media_id: record.media_id.clone(),
            content_type: record.content_type.clone(),
            upload_name: record.upload_name.clone(),
            size_bytes: record.size_bytes,
            stream: None,
            known_record: Some(record),
        }
    }
}

impl fmt::Debug for MinimalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinimalMedia")
            .field("origin", &self.origin)
            .field("media_id", &self.media_id)
            .field("content_type", &self.content_type)
            .field("upload_name", &self.upload_name)
            .field("size_bytes", &self.size_bytes)
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .field("known_record", &self.known_record)
            .finish()
    }
}

/// A fully-buffered content-cache entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub contents: Bytes,
}

/// Successful result of a remote fetch.
///
/// Exactly one of `record` / `stream` is guaranteed present; a blocking fetch yields the
/// finalized record, a non-blocking fetch yields a live stream before persistence finishes.
pub struct FetchedMedia {
    pub record: Option<MediaRecord>,
    pub stream: Option<ByteStream>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

impl fmt::Debug for FetchedMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedMedia")
            .field("record", &self.record)
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .finish()
    }
}

/// One-shot message delivered for each remote fetch request.
pub type FetchOutcome = Result<FetchedMedia, RepoError>;

/// Result of persisting a blob into a datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Backend-specific location the blob was written to.
    pub location: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256_hex: String,
    /// Number of bytes stored.
    pub size_bytes: u64,
}
