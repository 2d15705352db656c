//! Download and remote-fetch coordination core for a federated media repository.
//!
//! Clients upload binary blobs tagged with an origin server name and a locally-unique media
//! identifier; this crate owns the path that later turns `(origin, media_id)` back into a byte
//! stream plus metadata:
//! - concurrent requests for the same item coalesce into one execution (one metadata lookup,
//!   at most one remote fetch), with the resulting stream fanned out to every caller;
//! - a short-TTL hot cache elides repeated metadata-store hits, and a content-addressed cache
//!   serves hot blobs from memory;
//! - media this deployment does not hold is fetched from its origin server and persisted on
//!   the way through;
//! - policy gates (quarantine substitution, local-origin authority) run before any bytes move.
//!
//! This crate is composed of several modules:
//! - `download`: the [`DownloadService`] orchestrator, the public entry point.
//! - `coalesce`: keyed request coalescing with per-waiter result minting.
//! - `fanout`: one source stream cloned to N independent consumers.
//! - `fetch`: the remote fetch worker pool and its transport seam.
//! - `cache`: the hot metadata cache and the content-addressed blob cache.
//! - `store`: metadata persistence (SQLite and in-memory).
//! - `datastore`: pluggable blob backends (filesystem and in-memory).
//! - `quarantine`: the substitution artifact served for quarantined media.
//! - `settings` / `model` / `error`: configuration, data model and error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from the internal
//! modules to form the public API of the `media-repo` crate.

mod cache;
mod coalesce;
mod datastore;
mod download;
mod error;
mod fanout;
mod fetch;
mod model;
mod quarantine;
mod settings;
mod store;

pub use crate::cache::{ContentCache, HotMediaCache, MemoryContentCache};
pub use crate::coalesce::RequestGroup;
pub use crate::datastore::{Datastore, DatastoreMap, FsDatastore, MemoryDatastore};
pub use crate::download::DownloadService;
pub use crate::error::{RepoError, RepoResult};
pub use crate::fanout::clone_reader;
pub use crate::fetch::{HttpTransport, MediaTransport, RemoteFetcher, RemoteMedia};
pub use crate::model::{
    buffered_stream, media_cache_key, now_millis, ByteStream, CachedEntry, FetchOutcome,
    FetchedMedia, MediaRecord, MinimalMedia, StoredBlob,
};
pub use crate::quarantine::{
    encode_png, generate as generate_quarantine_artifact, QUARANTINE_CONTENT_TYPE,
    QUARANTINE_UPLOAD_NAME,
};
pub use crate::settings::{OriginAuthority, RepoSettings, SettingsHandle};
pub use crate::store::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};

pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
