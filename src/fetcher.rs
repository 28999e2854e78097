// =============================================================================
// fetcher.rs — THE SNAPSHOT HAULER
// =============================================================================
//
// Downloads one CSV snapshot and writes it to disk as it arrives. The body
// is never held in memory as a whole; on a bad outbreak day the wind file
// alone can run to thousands of lines.
//
// The destination is always truncated first. A half-written file from a
// previous, interrupted tick is never appended to and never trusted: if
// fetch() returns an error the caller skips this variant for the tick.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::error::FetchError;

/// Anything that can put a snapshot at `destination`.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Download `endpoint` into `destination`, returning the bytes written.
    async fn fetch(&self, endpoint: &Url, destination: &Path) -> Result<u64, FetchError>;
}

/// The real thing: HTTP GET via reqwest, streamed to a tokio file.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SnapshotFetcher for HttpFetcher {
    async fn fetch(&self, endpoint: &Url, destination: &Path) -> Result<u64, FetchError> {
        debug!(url = %endpoint, destination = %destination.display(), "Requesting snapshot");

        let response = self
            .client
            .get(endpoint.clone())
            .send()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("unexpected status"),
            ));
        }

        let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
            FetchError::transport(format!("cannot create {}: {e}", destination.display()))
        })?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| FetchError::transport(format!("body stream: {e}")))?;
            file.write_all(&chunk).await.map_err(|e| {
                FetchError::transport(format!("write to {}: {e}", destination.display()))
            })?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| {
            FetchError::transport(format!("flush {}: {e}", destination.display()))
        })?;

        info!(
            url = %endpoint,
            bytes = written,
            destination = %destination.display(),
            "Snapshot downloaded"
        );

        Ok(written)
    }
}
