//! Asset cache controller.
//!
//! An [`AssetWorker`] precaches a fixed list of assets into its cache
//! namespace, then answers resource requests cache-first. A
//! [`Registration`] owns the active worker and swaps in new versions only
//! once they installed completely.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{StreamExt, stream};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::net::Network;
use crate::request::{Destination, Method, Request, RequestMode, Response};
use crate::store::{CacheNamespace, CacheStore};

/// Number of precache requests in flight during install.
const INSTALL_CONCURRENCY: usize = 4;

/// Assets cached at install when nothing else is configured.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/app.js",
    "/style.css",
    "/manifest.json",
    "/vendor/web-stable-diffusion/websd.min.js",
];

/// Name of the cache namespace shared by the worker and the model fetcher.
pub const DEFAULT_CACHE_NAME: &str = "nyvera-cache-v1";

/// What a worker caches and where its assets live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Cache namespace owned by this worker generation.
    pub cache_name: String,
    /// Asset paths or absolute URLs fetched at install.
    pub precache: Vec<String>,
    /// Origin that relative precache paths resolve against.
    pub origin: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            precache: DEFAULT_PRECACHE.iter().map(ToString::to_string).collect(),
            origin: None,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_precache<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = urls.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Precache entries as absolute URLs.
    #[must_use]
    pub fn precache_urls(&self) -> Vec<String> {
        self.precache
            .iter()
            .map(|entry| resolve_url(self.origin.as_deref(), entry))
            .collect()
    }
}

/// Joins a path onto `origin`. Absolute URLs and paths without an origin
/// pass through unchanged.
#[must_use]
pub fn resolve_url(origin: Option<&str>, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    match origin {
        Some(origin) => {
            let origin = origin.trim_end_matches('/');
            if path.starts_with('/') {
                format!("{origin}{path}")
            } else {
                format!("{origin}/{path}")
            }
        }
        None => path.to_string(),
    }
}

/// Lifecycle of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Install failed or a newer worker took over.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        })
    }
}

/// One version of the asset cache controller.
pub struct AssetWorker {
    config: WorkerConfig,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    state: Mutex<WorkerState>,
}

impl AssetWorker {
    #[must_use]
    pub fn new(config: WorkerConfig, store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            store,
            network,
            state: Mutex::new(WorkerState::Parsed),
        }
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        log::debug!("Worker {} is now {state}", self.config.cache_name);
    }

    async fn namespace(&self) -> Result<Arc<dyn CacheNamespace>> {
        self.store.open(&self.config.cache_name).await
    }

    /// Fetches every precache URL and commits them as one batch.
    ///
    /// Either all assets end up in the namespace or none do. On failure the
    /// worker becomes [`WorkerState::Redundant`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstallFailed`] if any asset fails to download,
    /// answers with a non-success status, or the batch cannot be stored.
    pub async fn install(&self) -> Result<()> {
        self.set_state(WorkerState::Installing);
        match self.precache().await {
            Ok(count) => {
                log::info!(
                    "Installed {} with {count} precached assets",
                    self.config.cache_name
                );
                self.set_state(WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                log::warn!("Install of {} failed: {e}", self.config.cache_name);
                self.set_state(WorkerState::Redundant);
                Err(match e {
                    Error::InstallFailed(_) => e,
                    other => Error::InstallFailed(other.to_string()),
                })
            }
        }
    }

    async fn precache(&self) -> Result<usize> {
        let urls = self.config.precache_urls();
        let network = &self.network;

        let results: Vec<Result<(String, Response)>> = stream::iter(urls)
            .map(|url| async move {
                let request = Request::get(url.clone()).with_mode(RequestMode::Cors);
                let response = network
                    .fetch(&request)
                    .await
                    .map_err(|e| Error::InstallFailed(format!("{url}: {e}")))?;
                if !response.is_cacheable() {
                    return Err(Error::InstallFailed(format!(
                        "{url}: unusable response (status {}, {:?})",
                        response.status, response.kind
                    )));
                }
                Ok((url, response))
            })
            .buffered(INSTALL_CONCURRENCY)
            .collect()
            .await;

        let entries = results.into_iter().collect::<Result<Vec<_>>>()?;
        self.namespace().await?.put_all(&entries).await?;
        Ok(entries.len())
    }

    /// Takes control and deletes namespaces left by older generations.
    ///
    /// Returns the names of the deleted namespaces. A namespace that fails to
    /// delete is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list its namespaces.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.set_state(WorkerState::Activating);
        let mut deleted = Vec::new();
        for name in self.store.names().await? {
            if name == self.config.cache_name {
                continue;
            }
            match self.store.delete(&name).await {
                Ok(true) => {
                    log::info!("Deleted stale cache {name}");
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => log::warn!("Could not delete stale cache {name}: {e}"),
            }
        }
        self.set_state(WorkerState::Activated);
        Ok(deleted)
    }

    /// Answers one intercepted request.
    ///
    /// `GET` requests are served from the namespace when possible. Misses go
    /// to the network and successful, readable responses are stored before
    /// being returned. Other methods always go to the network.
    ///
    /// # Errors
    ///
    /// Returns the network error when the request misses the cache and the
    /// network fails, unless the request is for an image, which gets an empty
    /// `404` instead.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
        if request.method != Method::Get {
            return self.network.fetch(request).await;
        }

        let ns = match self.namespace().await {
            Ok(ns) => Some(ns),
            Err(e) => {
                log::warn!("Cache {} unavailable: {e}", self.config.cache_name);
                None
            }
        };

        if let Some(ns) = &ns {
            match ns.lookup(&request.url).await {
                Ok(Some(hit)) => {
                    log::debug!("Serving {} from cache", request.url);
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Cache lookup for {} failed: {e}", request.url),
            }
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable()
                    && let Some(ns) = &ns
                    && let Err(e) = ns.put(&request.url, &response).await
                {
                    log::warn!("Could not cache {}: {e}", request.url);
                }
                Ok(response)
            }
            Err(e) if request.destination == Destination::Image => {
                log::debug!("Image {} unavailable offline: {e}", request.url);
                Ok(Response::not_found(request.url.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Holds the active worker and performs version upgrades.
pub struct Registration {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    active: RwLock<Option<Arc<AssetWorker>>>,
}

impl Registration {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
        Self {
            store,
            network,
            active: RwLock::new(None),
        }
    }

    /// Installs and activates a worker for `config`.
    ///
    /// The new worker replaces the active one only after a successful
    /// install. If install fails the previous worker keeps serving.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstallFailed`] if precaching failed, or a store error
    /// if activation could not list namespaces.
    pub async fn register(&self, config: WorkerConfig) -> Result<Arc<AssetWorker>> {
        let worker = Arc::new(AssetWorker::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.network),
        ));
        worker.install().await?;

        let mut active = self.active.write().await;
        worker.activate().await?;
        if let Some(previous) = active.replace(Arc::clone(&worker))
            && !Arc::ptr_eq(&previous, &worker)
        {
            previous.set_state(WorkerState::Redundant);
        }
        Ok(worker)
    }

    /// The worker currently in control, if any.
    pub async fn active(&self) -> Option<Arc<AssetWorker>> {
        self.active.read().await.clone()
    }

    /// Routes a request through the active worker, or straight to the
    /// network when none is registered.
    ///
    /// # Errors
    ///
    /// See [`AssetWorker::handle_fetch`].
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
        match self.active().await {
            Some(worker) => worker.handle_fetch(request).await,
            None => self.network.fetch(request).await,
        }
    }
}
