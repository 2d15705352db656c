//! Crate error type.
//!
//! This module defines [`RepoError`] and the [`RepoResult`] alias used across the crate.
//!
//! Implementation note: the I/O-shaped variants are string-based so the public API does not
//! expose a specific database or HTTP client error type, and so the whole enum stays `Clone` —
//! a failed coalesced execution delivers the same error to every attached caller.

use std::io;

use thiserror::Error;

/// Result type used by this crate.
pub type RepoResult<T> = Result<T, RepoError>;

/// Unified error type for the media repository core.
#[derive(Debug, Clone, Error)]
pub enum RepoError {
    /// No record anywhere, a local-authority miss, or the remote refused to provide the item.
    #[error("media not found")]
    NotFound,

    /// Policy forbids serving the bytes and no replacement artifact is configured.
    #[error("media is quarantined")]
    Quarantined,

    /// The remote fetch failed transiently (bad gateway, timeout, connect failure).
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The item exceeds the configured size limit.
    #[error("size limit exceeded ({actual} > {limit} bytes)")]
    SizeLimit {
        /// Observed size, or the size at which the limit tripped.
        actual: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Datastore or metadata store I/O failed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RepoError {
    /// Whether a caller may reasonably retry the same request.
    ///
    /// `NotFound` and `Quarantined` are terminal; `Cancelled` is silent.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RepoError::UpstreamUnavailable(_) | RepoError::StorageUnavailable(_)
        )
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        RepoError::Internal(msg.into())
    }
}

impl From<io::Error> for RepoError {
    fn from(err: io::Error) -> Self {
        RepoError::StorageUnavailable(err.to_string())
    }
}
