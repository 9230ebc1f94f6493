//! Chunked model fetcher.
//!
//! Downloads one large binary resource with progress reporting, keeps the
//! assembled bytes in the shared cache namespace keyed by URL, and serves
//! later requests for the same URL straight from that cache.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::format::format_bytes;
use crate::net::Network;
use crate::request::Response;
use crate::stats::{FetchStats, FetchStatsTracker, ProgressState};
use crate::store::CacheStore;

/// Upper bound for buffer pre-allocation from an untrusted `Content-Length`.
const MAX_PREALLOC: u64 = 512 * 1024 * 1024;

/// Trait for receiving fetch progress updates.
///
/// All methods have default no-op implementations for convenience.
pub trait DownloadProgress: Send + Sync {
    /// Called when the network stream opens.
    fn on_start(&self, _url: &str, _total: Option<u64>) {}

    /// Called after every chunk has been appended to the buffer.
    fn on_progress(&self, _url: &str, _progress: &ProgressState, _speed: u64) {}

    /// Called when the payload is served from the cache.
    fn on_cache_hit(&self, _url: &str, _size: u64) {}

    /// Called when the fetch completed, from cache or network.
    fn on_complete(&self, _url: &str, _stats: &FetchStats) {}

    /// Called when the fetch failed. Not called on cancellation.
    fn on_error(&self, _url: &str, _error: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl DownloadProgress for NoProgress {}

/// The bytes of a fetched resource.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    pub stats: FetchStats,
}

/// Fetches large resources through the shared cache namespace.
pub struct ModelFetcher {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    cache_name: String,
}

impl ModelFetcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            network,
            cache_name: cache_name.into(),
        }
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Returns the bytes of `url`, from the cache when present.
    ///
    /// On a miss the resource is streamed, reassembled in arrival order and
    /// stored under `url` before being returned. A failed or cancelled
    /// download stores nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened, answers with a
    /// non-success status, breaks mid-way, ends short of its declared
    /// length, or `cancel` fires.
    pub async fn fetch(
        &self,
        url: &str,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<Fetched> {
        let tracker = FetchStatsTracker::new();
        let ns = self.store.open(&self.cache_name).await?;

        match ns.lookup(url).await {
            Ok(Some(cached)) => {
                let size = cached.body.len() as u64;
                log::debug!("Cache hit for {url} ({size} bytes)");
                progress.on_cache_hit(url, size);
                let stats = tracker.finish_cached(size);
                progress.on_complete(url, &stats);
                return Ok(Fetched {
                    bytes: cached.body,
                    stats,
                });
            }
            Ok(None) => {}
            Err(e) => log::warn!("Ignoring unreadable cache entry for {url}: {e}"),
        }

        match self.download(url, progress, cancel).await {
            Ok((bytes, stats)) => {
                let response = Response::ok(url, bytes.clone())
                    .with_header("content-length", bytes.len().to_string());
                // The bytes are still good when persisting them fails.
                if let Err(e) = ns.put(url, &response).await {
                    log::warn!("Could not cache {url}: {e}");
                }
                progress.on_complete(url, &stats);
                Ok(Fetched { bytes, stats })
            }
            Err(e) => {
                if !matches!(e, Error::Cancelled) {
                    progress.on_error(url, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Streams `url` into one contiguous buffer.
    async fn download(
        &self,
        url: &str,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, FetchStats)> {
        let mut body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            opened = self.network.stream(url) => opened?,
        };
        if !(200..300).contains(&body.status) {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: body.status,
            });
        }

        let mut state = ProgressState::new(body.content_length);
        progress.on_start(url, state.total);
        log::info!(
            "Downloading {url} ({})",
            state
                .total
                .map_or_else(|| "unknown size".to_string(), format_bytes)
        );

        let capacity = state.total.unwrap_or(0).min(MAX_PREALLOC);
        let mut buffer = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        let mut tracker = FetchStatsTracker::new();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = body.chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            buffer.extend_from_slice(&chunk);
            state.received += chunk.len() as u64;
            let speed = tracker.record_bytes(chunk.len() as u64);
            progress.on_progress(url, &state, speed);
        }

        if let Some(total) = state.total
            && state.received != total
        {
            return Err(Error::Download(format!(
                "{url}: expected {total} bytes, received {}",
                state.received
            )));
        }

        Ok((buffer.freeze(), tracker.finish()))
    }
}
