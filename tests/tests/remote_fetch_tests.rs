//! Remote-fetch behavior seen through the orchestrator: fetched records are served locally
//! afterwards, the minimal path reports real sizes once a record exists, and persistent
//! backends (SQLite + filesystem) carry the same flow end-to-end.

use std::sync::Arc;

use bytes::Bytes;

use media_repo::{
    CancellationToken, Datastore, DatastoreMap, DownloadService, FsDatastore, MediaTransport,
    MemoryContentCache, MetadataStore, OriginAuthority, RemoteFetcher, RepoSettings,
    SettingsHandle, SqliteMetadataStore,
};

mod fixture;

use fixture::{read_stream, FixedTransport, HarnessBuilder, REMOTE_ORIGIN};

#[tokio::test]
async fn fetched_media_is_served_locally_afterwards() {
    let payload = Bytes::from_static(b"fetch once, serve twice");
    let harness = HarnessBuilder::new().remote_bytes(payload.clone()).build();

    let mut first = harness.get(REMOTE_ORIGIN, "zzz", true, true).await.unwrap();
    assert_eq!(read_stream(&mut first).await, payload);
    assert_eq!(harness.transport.calls(), 1);

    // second call is answered from the hot cache and the local datastore
    let queries_after_first = harness.metadata.get_calls();
    let mut second = harness.get(REMOTE_ORIGIN, "zzz", true, true).await.unwrap();
    assert_eq!(read_stream(&mut second).await, payload);
    assert_eq!(harness.transport.calls(), 1);
    assert_eq!(harness.metadata.get_calls(), queries_after_first);
}

#[tokio::test]
async fn minimal_path_reports_the_real_size_once_a_record_exists() {
    let payload = Bytes::from_static(b"sized payload");
    let harness = HarnessBuilder::new().remote_bytes(payload.clone()).build();

    let mut view = harness.get(REMOTE_ORIGIN, "zzz", true, false).await.unwrap();
    assert_eq!(view.size_bytes, payload.len() as i64);
    assert!(view.known_record.is_some());
    assert_eq!(read_stream(&mut view).await, payload);
}

#[tokio::test]
async fn end_to_end_with_persistent_backends() {
    fixture::init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let settings = SettingsHandle::new(RepoSettings {
        authority: OriginAuthority::new(["us.org"]),
        ..RepoSettings::default()
    });
    let metadata = Arc::new(SqliteMetadataStore::open(&dir.path().join("media.db")).unwrap());
    let datastore = Arc::new(
        FsDatastore::create("fs", dir.path().join("blobs"), None)
            .await
            .unwrap(),
    );
    let mut datastores = DatastoreMap::new();
    datastores.register(Arc::clone(&datastore) as Arc<dyn Datastore>);

    let payload = Bytes::from_static(b"persisted through real backends");
    let transport = Arc::new(FixedTransport::new(payload.clone()));
    let fetcher = Arc::new(RemoteFetcher::new(
        Arc::clone(&transport) as Arc<dyn MediaTransport>,
        Arc::clone(&datastore) as Arc<dyn Datastore>,
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        settings.clone(),
    ));
    let service = DownloadService::new(
        settings,
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        Arc::new(datastores),
        Arc::new(MemoryContentCache::new()),
        fetcher,
    );

    // fetch from the remote origin, persist to sqlite + disk
    let mut view = service
        .get(REMOTE_ORIGIN, "zzz", true, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_stream(&mut view).await, payload);

    // the record survives in sqlite and the blob on disk
    let record = metadata
        .get_media(REMOTE_ORIGIN, "zzz")
        .await
        .unwrap()
        .expect("record persisted");
    assert_eq!(record.size_bytes, payload.len() as i64);
    assert_eq!(transport.calls(), 1);

    // a later service instance serves it without touching the transport
    let mut again = service
        .get(REMOTE_ORIGIN, "zzz", false, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_stream(&mut again).await, payload);
    assert_eq!(transport.calls(), 1);
}
