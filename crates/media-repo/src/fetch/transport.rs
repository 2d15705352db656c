//! Outbound transport for remote media downloads.
//!
//! [`MediaTransport`] is the seam between the fetch workers and the wire: the workers own
//! retry, persistence and record creation; the transport owns a single request/response
//! exchange. [`HttpTransport`] is the production implementation over a shared reqwest client
//! (connection pooling and DNS caching stay consistent across all origins).

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{RepoError, RepoResult};
use crate::model::ByteStream;

/// An open upstream response for one media item.
pub struct RemoteMedia {
    pub stream: ByteStream,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub content_length: Option<u64>,
}

/// One request/response exchange with an origin server.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Open the origin's download endpoint for one media item.
    async fn fetch(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        media_id: &str,
    ) -> RepoResult<RemoteMedia>;
}

/// HTTP transport over the federation download endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    scheme: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(scheme: impl Into<String>, request_timeout: Duration) -> RepoResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RepoError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            request_timeout,
        })
    }

    fn download_url(&self, origin: &str, media_id: &str) -> RepoResult<Url> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme, origin)).map_err(|e| {
            RepoError::UpstreamUnavailable(format!("invalid origin '{origin}': {e}"))
        })?;
        url.path_segments_mut()
            .map_err(|_| RepoError::UpstreamUnavailable(format!("origin '{origin}' cannot carry a path")))?
            .extend(["_media", "v1", "download", origin, media_id]);
        Ok(url)
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn fetch(
        &self,
        ctx: &CancellationToken,
        origin: &str,
        media_id: &str,
    ) -> RepoResult<RemoteMedia> {
        let url = self.download_url(origin, media_id)?;
        debug!(%url, "requesting remote media");

        let send = tokio::time::timeout(self.request_timeout, self.client.get(url.clone()).send());
        let response = tokio::select! {
            biased;
            res = send => match res {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(classify_send_error(&err, &url)),
                Err(_) => {
                    return Err(RepoError::UpstreamUnavailable(format!(
                        "request timeout for {url}"
                    )))
                }
            },
            _ = ctx.cancelled() => return Err(RepoError::Cancelled),
        };

        match response.status() {
            StatusCode::NOT_FOUND => return Err(RepoError::NotFound),
            status if !status.is_success() => {
                return Err(RepoError::UpstreamUnavailable(format!(
                    "{status} for {url}"
                )))
            }
            _ => {}
        }

        let content_type = header_str(&response, reqwest::header::CONTENT_TYPE);
        let filename = header_str(&response, reqwest::header::CONTENT_DISPOSITION)
            .as_deref()
            .and_then(disposition_filename);
        let content_length = response.content_length();

        let stream = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        Ok(RemoteMedia {
            stream: Box::new(StreamReader::new(stream)),
            content_type,
            filename,
            content_length,
        })
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn classify_send_error(err: &reqwest::Error, url: &Url) -> RepoError {
    if err.is_timeout() {
        RepoError::UpstreamUnavailable(format!("request timeout for {url}"))
    } else {
        RepoError::UpstreamUnavailable(format!("request to {url} failed: {err}"))
    }
}

/// Pull the filename out of a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(raw) = part.strip_prefix("filename=") {
            let name = raw.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}
