//! Download orchestration.
//!
//! [`DownloadService::get`] is the entry point the HTTP handlers call: given
//! `(origin, media_id)` it produces a [`MinimalMedia`] with an open byte stream, going through
//! the hot metadata cache, the metadata store, the remote fetcher, the content cache and the
//! datastore in that order, under request coalescing so concurrent identical requests cost one
//! lookup and at most one remote fetch.
//!
//! Policy gates run before any bytes move: a quarantined record never leaks through a content
//! cache hit, and an origin this deployment hosts is never fetched remotely.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{ContentCache, HotMediaCache};
use crate::coalesce::RequestGroup;
use crate::datastore::DatastoreMap;
use crate::error::{RepoError, RepoResult};
use crate::fanout::clone_reader;
use crate::fetch::RemoteFetcher;
use crate::model::{
    buffered_stream, media_cache_key, now_millis, FetchedMedia, MediaRecord, MinimalMedia,
};
use crate::quarantine;
use crate::settings::SettingsHandle;
use crate::store::MetadataStore;

struct Shared {
    settings: SettingsHandle,
    metadata: Arc<dyn MetadataStore>,
    datastores: Arc<DatastoreMap>,
    content_cache: Arc<dyn ContentCache>,
    hot_cache: HotMediaCache,
    fetcher: Arc<RemoteFetcher>,
    record_group: RequestGroup<MediaRecord>,
}

/// The top-level download entry point.
pub struct DownloadService {
    shared: Arc<Shared>,
    media_group: RequestGroup<MinimalMedia>,
    sweeper: JoinHandle<()>,
}

impl DownloadService {
    /// Build the service. Must be called within a tokio runtime (the hot-cache sweeper is a
    /// spawned task, aborted when the service drops).
    pub fn new(
        settings: SettingsHandle,
        metadata: Arc<dyn MetadataStore>,
        datastores: Arc<DatastoreMap>,
        content_cache: Arc<dyn ContentCache>,
        fetcher: Arc<RemoteFetcher>,
    ) -> Self {
        let snapshot = settings.snapshot();
        let hot_cache = HotMediaCache::new(snapshot.hot_cache_ttl);
        let sweeper = hot_cache.spawn_sweeper(snapshot.hot_cache_sweep);
        Self {
            shared: Arc::new(Shared {
                settings,
                metadata,
                datastores,
                content_cache,
                hot_cache,
                fetcher,
                record_group: RequestGroup::new(),
            }),
            media_group: RequestGroup::new(),
            sweeper,
        }
    }

    /// Resolve one media item to a streamable view.
    ///
    /// `download_remote` controls whether an unknown item may be fetched from its origin;
    /// `block_for_media` demands the fully-resolved record (exact size and hash) before
    /// returning. Both are part of the coalescing identity, so callers with different
    /// demands never share an execution.
    pub async fn get(
        &self,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        block_for_media: bool,
        ctx: &CancellationToken,
    ) -> RepoResult<MinimalMedia> {
        let key = format!("{origin}/{media_id}?r={download_remote}&b={block_for_media}");
        let shared = Arc::clone(&self.shared);
        let content_cache = Arc::clone(&self.shared.content_cache);
        let origin = origin.to_string();
        let media_id = media_id.to_string();

        self.media_group
            .run(
                &key,
                ctx,
                move |body_ctx| async move {
                    shared
                        .resolve(&origin, &media_id, download_remote, block_for_media, &body_ctx)
                        .await
                },
                move |mut value, count| {
                    let streams: Vec<_> = match value.stream.take() {
                        Some(stream) => clone_reader(stream, count).into_iter().map(Some).collect(),
                        None => (0..count).map(|_| None).collect(),
                    };
                    streams
                        .into_iter()
                        .map(|stream| {
                            if let Some(record) = &value.known_record {
                                content_cache.increment_downloads(&record.sha256_hash);
                            }
                            MinimalMedia {
                                origin: value.origin.clone(),
                                media_id: value.media_id.clone(),
                                content_type: value.content_type.clone(),
                                upload_name: value.upload_name.clone(),
                                size_bytes: value.size_bytes,
                                stream,
                                known_record: value.known_record.clone(),
                            }
                        })
                        .collect()
                },
            )
            .await
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl Shared {
    /// The coalesced body: resolve a record/view, apply policy, attach a stream.
    async fn resolve(
        self: Arc<Self>,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        block_for_media: bool,
        ctx: &CancellationToken,
    ) -> RepoResult<MinimalMedia> {
        let mut minimal = if block_for_media {
            let record = Arc::clone(&self)
                .find_media_record(origin, media_id, download_remote, ctx)
                .await?;
            MinimalMedia::from_record(record)
        } else {
            self.find_minimal_media(origin, media_id, download_remote, ctx)
                .await?
        };

        if let Some(record) = minimal.known_record.clone() {
            if record.quarantined {
                warn!(origin, media_id, "quarantined media accessed");
                let settings = self.settings.snapshot();
                if settings.quarantine_replace_downloads {
                    debug!(origin, media_id, "serving quarantine replacement artifact");
                    return quarantine_view(origin, media_id, settings.quarantine_thumbnail_size, record);
                }
                return Err(RepoError::Quarantined);
            }

            if let Err(err) = self
                .metadata
                .upsert_last_access(&record.sha256_hash, now_millis())
                .await
            {
                warn!(error = %err, "failed to upsert the last access time");
            }

            self.hot_cache.insert(&record);

            if let Some(entry) = self.content_cache.get_media(&record).await? {
                if !entry.contents.is_empty() {
                    debug!(origin, media_id, "serving from the content cache");
                    minimal.stream = Some(buffered_stream(entry.contents));
                    return Ok(minimal);
                }
            }
        }

        if minimal.stream.is_some() {
            debug!(origin, media_id, "returning media with an already-open stream");
            return Ok(minimal);
        }

        let Some(record) = &minimal.known_record else {
            return Err(RepoError::internal(
                "neither stream nor record after resolution",
            ));
        };

        debug!(origin, media_id, "reading media from the datastore");
        let stream = self
            .datastores
            .open(ctx, &record.datastore_id, &record.location)
            .await?;
        minimal.stream = Some(stream);
        Ok(minimal)
    }

    /// Full-record resolution: hot cache, metadata store, then a blocking remote fetch.
    ///
    /// Metadata-only lookups are themselves coalesced under `origin/media_id`; records are
    /// immutable, so all waiters share one clone.
    async fn find_media_record(
        self: Arc<Self>,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        ctx: &CancellationToken,
    ) -> RepoResult<MediaRecord> {
        let key = media_cache_key(origin, media_id);
        let shared = Arc::clone(&self);
        let origin = origin.to_string();
        let media_id = media_id.to_string();
        self.record_group
            .run_shared(&key, ctx, move |body_ctx| async move {
                shared
                    .lookup_record(&origin, &media_id, download_remote, &body_ctx)
                    .await
            })
            .await
    }

    async fn lookup_record(
        &self,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        ctx: &CancellationToken,
    ) -> RepoResult<MediaRecord> {
        if let Some(record) = self.hot_cache.get(origin, media_id) {
            return Ok(record);
        }

        debug!(origin, media_id, "fetching media record from the metadata store");
        match with_ctx(ctx, self.metadata.get_media(origin, media_id)).await? {
            Some(record) => Ok(record),
            None => {
                self.check_remote_allowed(origin, media_id, download_remote)?;
                let fetched = self.fetch_remote(origin, media_id, ctx).await?;
                fetched.record.ok_or_else(|| {
                    RepoError::internal("remote fetch completed without a media record")
                })
            }
        }
    }

    /// Minimal resolution: like the full-record path, but a record-less live stream from the
    /// fetcher is served directly, with the size reported as unknown.
    async fn find_minimal_media(
        &self,
        origin: &str,
        media_id: &str,
        download_remote: bool,
        ctx: &CancellationToken,
    ) -> RepoResult<MinimalMedia> {
        let record = match self.hot_cache.get(origin, media_id) {
            Some(record) => record,
            None => {
                debug!(origin, media_id, "fetching media record from the metadata store");
                match with_ctx(ctx, self.metadata.get_media(origin, media_id)).await? {
                    Some(record) => record,
                    None => {
                        self.check_remote_allowed(origin, media_id, download_remote)?;
                        let fetched = self.fetch_remote(origin, media_id, ctx).await?;
                        match (fetched.record, fetched.stream) {
                            // finalized record: treat it like a store hit
                            (Some(record), _) => record,
                            (None, Some(stream)) => {
                                return Ok(MinimalMedia {
                                    origin: origin.to_string(),
                                    media_id: media_id.to_string(),
                                    content_type: fetched.content_type.unwrap_or_default(),
                                    upload_name: fetched.filename.unwrap_or_default(),
                                    size_bytes: -1,
                                    stream: Some(stream),
                                    known_record: None,
                                });
                            }
                            (None, None) => {
                                return Err(RepoError::internal(
                                    "remote fetch returned neither stream nor record",
                                ))
                            }
                        }
                    }
                }
            }
        };

        let stream = self
            .datastores
            .open(ctx, &record.datastore_id, &record.location)
            .await?;
        let mut minimal = MinimalMedia::from_record(record);
        minimal.stream = Some(stream);
        Ok(minimal)
    }

    /// Authority and policy gates before any remote fetch.
    fn check_remote_allowed(
        &self,
        origin: &str,
        media_id: &str,
        download_remote: bool,
    ) -> RepoResult<()> {
        if self.settings.snapshot().authority.is_ours(origin) {
            debug!(origin, media_id, "media not found on a locally-hosted origin");
            return Err(RepoError::NotFound);
        }
        if !download_remote {
            debug!(origin, media_id, "remote download disabled for this request");
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn fetch_remote(
        &self,
        origin: &str,
        media_id: &str,
        ctx: &CancellationToken,
    ) -> RepoResult<FetchedMedia> {
        let rx = self.fetcher.download_remote_media(origin, media_id, true);
        with_ctx(ctx, async {
            rx.await
                .map_err(|_| RepoError::internal("remote fetch dropped its result channel"))
        })
        .await?
    }
}

fn quarantine_view(
    origin: &str,
    media_id: &str,
    (width, height): (u32, u32),
    record: MediaRecord,
) -> RepoResult<MinimalMedia> {
    let image = quarantine::generate(width, height)?;
    let png = quarantine::encode_png(&image)?;
    Ok(MinimalMedia {
        origin: origin.to_string(),
        media_id: media_id.to_string(),
        content_type: quarantine::QUARANTINE_CONTENT_TYPE.to_string(),
        upload_name: quarantine::QUARANTINE_UPLOAD_NAME.to_string(),
        size_bytes: png.len() as i64,
        stream: Some(buffered_stream(Bytes::from(png))),
        known_record: Some(record),
    })
}

/// Prefer completing `fut`, but bail out with `Cancelled` once the context fires.
async fn with_ctx<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = RepoResult<T>>,
) -> RepoResult<T> {
    tokio::select! {
        biased;
        res = fut => res,
        _ = ctx.cancelled() => Err(RepoError::Cancelled),
    }
}
