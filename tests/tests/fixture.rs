//! Shared test harness: a complete in-memory media repository with counting fakes.
//!
//! The harness wires a [`DownloadService`] to an in-memory metadata store (with a query
//! counter and an optional injected last-access failure), an in-memory datastore, a real
//! content cache and a scripted transport, so scenarios can assert on exactly how many
//! lookups and remote fetches a download performed.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use media_repo::{
    buffered_stream, CachedEntry, CancellationToken, ContentCache, Datastore, DatastoreMap,
    DownloadService, MediaRecord, MediaTransport, MemoryContentCache, MemoryDatastore,
    MemoryMetadataStore, MetadataStore, MinimalMedia, OriginAuthority, RemoteFetcher,
    RemoteMedia, RepoError, RepoResult, RepoSettings, SettingsHandle,
};

pub const LOCAL_ORIGIN: &str = "us.org";
pub const REMOTE_ORIGIN: &str = "ex.org";
pub const DATASTORE_ID: &str = "mem";

/// Metadata store wrapper counting record lookups, with a switchable last-access failure and
/// a configurable lookup delay (so concurrent callers reliably overlap in coalescing tests).
pub struct CountingMetadataStore {
    inner: MemoryMetadataStore,
    get_calls: AtomicUsize,
    fail_last_access: AtomicBool,
    get_delay: Duration,
}

impl CountingMetadataStore {
    pub fn new(get_delay: Duration) -> Self {
        Self {
            inner: MemoryMetadataStore::new(),
            get_calls: AtomicUsize::new(0),
            fail_last_access: AtomicBool::new(false),
            get_delay,
        }
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn fail_last_access(&self, fail: bool) {
        self.fail_last_access.store(fail, Ordering::SeqCst);
    }

    pub fn last_access(&self, sha256_hash: &str) -> Option<i64> {
        self.inner.last_access(sha256_hash)
    }
}

#[async_trait]
impl MetadataStore for CountingMetadataStore {
    async fn get_media(&self, origin: &str, media_id: &str) -> RepoResult<Option<MediaRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        self.inner.get_media(origin, media_id).await
    }

    async fn insert_media(&self, record: &MediaRecord) -> RepoResult<()> {
        self.inner.insert_media(record).await
    }

    async fn set_quarantined(
        &self,
        origin: &str,
        media_id: &str,
        quarantined: bool,
    ) -> RepoResult<bool> {
        self.inner.set_quarantined(origin, media_id, quarantined).await
    }

    async fn upsert_last_access(&self, sha256_hash: &str, now_ms: i64) -> RepoResult<()> {
        if self.fail_last_access.load(Ordering::SeqCst) {
            return Err(RepoError::StorageUnavailable(
                "last-access table is on fire".into(),
            ));
        }
        self.inner.upsert_last_access(sha256_hash, now_ms).await
    }
}

/// Transport serving one fixed payload, counting invocations.
pub struct FixedTransport {
    data: Bytes,
    content_type: String,
    filename: String,
    calls: AtomicUsize,
}

impl FixedTransport {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            content_type: "image/jpeg".into(),
            filename: "remote.jpg".into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for FixedTransport {
    async fn fetch(
        &self,
        _ctx: &CancellationToken,
        _origin: &str,
        _media_id: &str,
    ) -> RepoResult<RemoteMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(RemoteMedia {
            content_length: Some(self.data.len() as u64),
            stream: buffered_stream(self.data.clone()),
            content_type: Some(self.content_type.clone()),
            filename: Some(self.filename.clone()),
        })
    }
}

/// Content cache whose probe always fails, for the surface-as-error path.
pub struct FailingContentCache;

#[async_trait]
impl ContentCache for FailingContentCache {
    async fn get_media(&self, _record: &MediaRecord) -> RepoResult<Option<CachedEntry>> {
        Err(RepoError::StorageUnavailable("cache probe failed".into()))
    }

    fn increment_downloads(&self, _sha256_hash: &str) {}

    fn download_count(&self, _sha256_hash: &str) -> u64 {
        0
    }
}

pub struct Harness {
    pub service: DownloadService,
    pub metadata: Arc<CountingMetadataStore>,
    pub transport: Arc<FixedTransport>,
    pub content_cache: Arc<MemoryContentCache>,
    pub datastore: Arc<MemoryDatastore>,
    pub settings: SettingsHandle,
}

pub struct HarnessBuilder {
    settings: RepoSettings,
    remote_bytes: Bytes,
    metadata_delay: Duration,
    failing_content_cache: bool,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let settings = RepoSettings {
            authority: OriginAuthority::new([LOCAL_ORIGIN]),
            fetch_retry_base_delay: Duration::from_millis(1),
            fetch_max_retry_delay: Duration::from_millis(5),
            ..RepoSettings::default()
        };
        Self {
            settings,
            remote_bytes: Bytes::from_static(b"remote payload"),
            metadata_delay: Duration::ZERO,
            failing_content_cache: false,
        }
    }

    pub fn settings(mut self, f: impl FnOnce(&mut RepoSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn remote_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.remote_bytes = data.into();
        self
    }

    pub fn metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    pub fn failing_content_cache(mut self) -> Self {
        self.failing_content_cache = true;
        self
    }

    pub fn build(self) -> Harness {
        init_tracing();

        let settings = SettingsHandle::new(self.settings);
        let metadata = Arc::new(CountingMetadataStore::new(self.metadata_delay));
        let transport = Arc::new(FixedTransport::new(self.remote_bytes));
        let content_cache = Arc::new(MemoryContentCache::new());
        let datastore = Arc::new(MemoryDatastore::new(DATASTORE_ID, None));

        let mut datastores = DatastoreMap::new();
        datastores.register(Arc::clone(&datastore) as Arc<dyn Datastore>);

        let fetcher = Arc::new(RemoteFetcher::new(
            Arc::clone(&transport) as Arc<dyn MediaTransport>,
            Arc::clone(&datastore) as Arc<dyn Datastore>,
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            settings.clone(),
        ));

        let service_cache: Arc<dyn ContentCache> = if self.failing_content_cache {
            Arc::new(FailingContentCache)
        } else {
            Arc::clone(&content_cache) as Arc<dyn ContentCache>
        };

        let service = DownloadService::new(
            settings.clone(),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::new(datastores),
            service_cache,
            fetcher,
        );

        Harness {
            service,
            metadata,
            transport,
            content_cache,
            datastore,
            settings,
        }
    }
}

impl Harness {
    /// Store a blob and its record, as an earlier upload would have.
    pub async fn seed(&self, origin: &str, media_id: &str, data: impl Into<Bytes>) -> MediaRecord {
        let blob = self.datastore.put(buffered_stream(data.into())).await.unwrap();
        let record = MediaRecord {
            origin: origin.into(),
            media_id: media_id.into(),
            sha256_hash: blob.sha256_hex,
            size_bytes: blob.size_bytes as i64,
            content_type: "application/octet-stream".into(),
            upload_name: "file.bin".into(),
            datastore_id: DATASTORE_ID.into(),
            location: blob.location,
            quarantined: false,
            upload_ts_ms: 1_700_000_000_000,
        };
        self.metadata.insert_media(&record).await.unwrap();
        record
    }

    /// `get` with a fresh, never-cancelled context.
    pub async fn get(
        &self,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        block_for_media: bool,
    ) -> RepoResult<MinimalMedia> {
        self.service
            .get(
                origin,
                media_id,
                download_remote,
                block_for_media,
                &CancellationToken::new(),
            )
            .await
    }
}

/// Drain a view's stream.
pub async fn read_stream(view: &mut MinimalMedia) -> Vec<u8> {
    let mut stream = view.stream.take().expect("view carries no stream");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

/// Opt-in tracing: run with `RUST_LOG=media_repo=debug` to watch the download path narrate
/// itself.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
