//! Remote media fetching.
//!
//! [`RemoteFetcher`] owns a bounded pool of workers consuming a job queue. A request for
//! `(origin, media_id)` either enqueues a new job or attaches to the pending one, so the
//! fetcher never downloads the same item twice concurrently — independently of the request
//! coalescing the download orchestrator does at its own layer.
//!
//! A worker fetches via the injected [`MediaTransport`] (with bounded, jittered retries for
//! transient upstream failures), streams the blob into the target datastore while the size
//! limit is enforced, creates the media record, and delivers exactly one [`FetchOutcome`] to
//! every attached caller.
//!
//! With `wait_for_completion = false` the outcome is delivered as soon as the upstream stream
//! is open: callers get live stream clones while persistence continues in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::error::{RepoError, RepoResult};
use crate::fanout::clone_reader;
use crate::model::{now_millis, ByteStream, FetchOutcome, FetchedMedia, MediaRecord};
use crate::settings::SettingsHandle;
use crate::store::MetadataStore;

mod transport;

pub use transport::{HttpTransport, MediaTransport, RemoteMedia};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

struct FetchJob {
    origin: String,
    media_id: String,
    wait_for_completion: bool,
}

type PendingMap = Mutex<HashMap<(String, String), Vec<oneshot::Sender<FetchOutcome>>>>;

struct FetcherShared {
    transport: Arc<dyn MediaTransport>,
    datastore: Arc<dyn Datastore>,
    metadata: Arc<dyn MetadataStore>,
    settings: SettingsHandle,
    pending: PendingMap,
}

/// Worker pool downloading media from remote origins and persisting it locally.
pub struct RemoteFetcher {
    shared: Arc<FetcherShared>,
    jobs: mpsc::UnboundedSender<FetchJob>,
    shutdown: CancellationToken,
}

impl RemoteFetcher {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        datastore: Arc<dyn Datastore>,
        metadata: Arc<dyn MetadataStore>,
        settings: SettingsHandle,
    ) -> Self {
        let shared = Arc::new(FetcherShared {
            transport,
            datastore,
            metadata,
            settings: settings.clone(),
            pending: Mutex::new(HashMap::new()),
        });

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let shutdown = CancellationToken::new();

        let workers = settings.snapshot().fetch_workers.max(1);
        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            let jobs_rx = Arc::clone(&jobs_rx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        job = async { jobs_rx.lock().await.recv().await } => job,
                        _ = shutdown.cancelled() => None,
                    };
                    let Some(job) = job else {
                        debug!(worker, "fetch worker stopping");
                        break;
                    };
                    shared.process(&shutdown, job).await;
                }
            });
        }

        Self {
            shared,
            jobs: jobs_tx,
            shutdown,
        }
    }

    /// Request a remote download.
    ///
    /// The returned channel delivers exactly one [`FetchOutcome`]; concurrent requests for the
    /// same `(origin, media_id)` attach to the pending job.
    pub fn download_remote_media(
        &self,
        origin: &str,
        media_id: &str,
        wait_for_completion: bool,
    ) -> oneshot::Receiver<FetchOutcome> {
        let (tx, rx) = oneshot::channel();
        let key = (origin.to_string(), media_id.to_string());

        let enqueue = {
            let mut pending = self.shared.pending.lock().expect("pending map lock poisoned");
            match pending.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    pending.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if enqueue {
            let job = FetchJob {
                origin: key.0.clone(),
                media_id: key.1.clone(),
                wait_for_completion,
            };
            if self.jobs.send(job).is_err() {
                self.shared.deliver(&key, || Err(RepoError::Cancelled));
            }
        }

        rx
    }
}

impl Drop for RemoteFetcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl FetcherShared {
    /// Take the attached callers for `key` and send each an outcome.
    fn deliver(&self, key: &(String, String), mut outcome: impl FnMut() -> FetchOutcome) {
        let waiters = {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            pending.remove(key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(outcome());
        }
    }

    /// Like `deliver`, but hands the waiter list back so the caller can mint per-waiter
    /// values (live stream clones).
    fn take_waiters(&self, key: &(String, String)) -> Vec<oneshot::Sender<FetchOutcome>> {
        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        pending.remove(key).unwrap_or_default()
    }

    async fn process(&self, ctx: &CancellationToken, job: FetchJob) {
        let key = (job.origin.clone(), job.media_id.clone());
        debug!(
            origin = %job.origin,
            media_id = %job.media_id,
            blocking = job.wait_for_completion,
            "downloading remote media"
        );

        if job.wait_for_completion {
            let result = self.fetch_with_retries(ctx, &job).await;
            match result {
                Ok(record) => self.deliver(&key, || {
                    Ok(FetchedMedia {
                        content_type: Some(record.content_type.clone()),
                        filename: Some(record.upload_name.clone()),
                        record: Some(record.clone()),
                        stream: None,
                    })
                }),
                Err(err) => {
                    warn!(
                        origin = %job.origin,
                        media_id = %job.media_id,
                        error = %err,
                        "remote download failed"
                    );
                    self.deliver(&key, || Err(err.clone()));
                }
            }
            return;
        }

        // Non-blocking: open the upstream stream, hand live clones to the callers, then keep
        // persisting on this worker.
        let remote = match self.open_with_retries(ctx, &job).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    origin = %job.origin,
                    media_id = %job.media_id,
                    error = %err,
                    "remote download failed"
                );
                self.deliver(&key, || Err(err.clone()));
                return;
            }
        };

        let content_type = remote.content_type.clone();
        let filename = remote.filename.clone();
        let waiters = self.take_waiters(&key);
        let mut streams = clone_reader(remote.stream, waiters.len() + 1);
        let persist_stream = streams.pop().expect("clone_reader returned too few streams");
        for (waiter, stream) in waiters.into_iter().zip(streams) {
            let _ = waiter.send(Ok(FetchedMedia {
                record: None,
                stream: Some(stream),
                content_type: content_type.clone(),
                filename: filename.clone(),
            }));
        }

        if let Err(err) = self
            .persist(&job, persist_stream, content_type, filename)
            .await
        {
            warn!(
                origin = %job.origin,
                media_id = %job.media_id,
                error = %err,
                "failed to persist remote media after streaming it"
            );
        }
    }

    /// Full blocking fetch: download, persist, create the record.
    async fn fetch_with_retries(
        &self,
        ctx: &CancellationToken,
        job: &FetchJob,
    ) -> RepoResult<MediaRecord> {
        let remote = self.open_with_retries(ctx, job).await?;
        self.persist(job, remote.stream, remote.content_type, remote.filename)
            .await
    }

    /// Open the upstream stream with retries, without consuming it.
    async fn open_with_retries(
        &self,
        ctx: &CancellationToken,
        job: &FetchJob,
    ) -> RepoResult<RemoteMedia> {
        let settings = self.settings.snapshot();
        let mut last_error = RepoError::UpstreamUnavailable("no fetch attempts made".into());

        for attempt in 0..=settings.fetch_max_retries {
            if ctx.is_cancelled() {
                return Err(RepoError::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(calculate_backoff(
                    attempt,
                    settings.fetch_retry_base_delay,
                    settings.fetch_max_retry_delay,
                ))
                .await;
            }
            match self.transport.fetch(ctx, &job.origin, &job.media_id).await {
                Ok(remote) => {
                    if let (Some(length), Some(limit)) =
                        (remote.content_length, settings.max_remote_bytes)
                    {
                        if length > limit {
                            return Err(RepoError::SizeLimit {
                                actual: length,
                                limit,
                            });
                        }
                    }
                    return Ok(remote);
                }
                Err(err) if retryable(&err) => {
                    debug!(attempt, error = %err, "transient upstream failure");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    /// Stream the blob into the datastore and insert the media record.
    async fn persist(
        &self,
        job: &FetchJob,
        stream: ByteStream,
        content_type: Option<String>,
        filename: Option<String>,
    ) -> RepoResult<MediaRecord> {
        let settings = self.settings.snapshot();
        let blob = self.datastore.put(stream).await?;
        if let Some(limit) = settings.max_remote_bytes {
            if blob.size_bytes > limit {
                return Err(RepoError::SizeLimit {
                    actual: blob.size_bytes,
                    limit,
                });
            }
        }

        let record = MediaRecord {
            origin: job.origin.clone(),
            media_id: job.media_id.clone(),
            sha256_hash: blob.sha256_hex,
            size_bytes: blob.size_bytes as i64,
            content_type: content_type.unwrap_or_else(|| FALLBACK_CONTENT_TYPE.into()),
            upload_name: filename.unwrap_or_default(),
            datastore_id: self.datastore.id().to_string(),
            location: blob.location,
            quarantined: false,
            upload_ts_ms: now_millis(),
        };
        self.metadata.insert_media(&record).await?;
        debug!(
            origin = %record.origin,
            media_id = %record.media_id,
            size = record.size_bytes,
            "remote media persisted"
        );
        Ok(record)
    }
}

fn retryable(err: &RepoError) -> bool {
    matches!(err, RepoError::UpstreamUnavailable(_))
}

/// Exponential backoff with 0-25% jitter, capped at `max`.
fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let base_ms = base.as_millis() as u64;
    let exp = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exp);
    let jitter = if delay_ms > 0 {
        rand::rng().random_range(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter)).min(max)
}
