//! The offline worker: install-time pre-caching and network-first fetch
//! handling with cache fallback.
//!
//! [`install`] and [`respond`] are the two handlers as plain functions over a
//! [`Network`] and a [`CacheStorage`]. [`Worker`] wraps them with the
//! lifecycle a host needs: fetches are only intercepted once install has
//! succeeded and only for URLs inside the configured scope.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Url;
use serde::Serialize;

use crate::cache::{self, CacheEntry, CacheStorage, DiskStorage};
use crate::config::{AppConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::http::{Request, Response, cache_key};
use crate::network::{HttpNetwork, Network};
use crate::stats::{FetchStats, InstallStats};

/// Trait for receiving install progress updates.
///
/// All methods have default no-op implementations for convenience.
pub trait InstallProgress: Send + Sync {
    /// Called once the cache is open and fetching begins.
    fn on_install_start(&self, _cache: &str, _assets: usize) {}

    /// Called when an asset has been fetched successfully.
    fn on_asset_fetched(&self, _url: &str, _bytes: u64) {}

    /// Called when an asset fetch fails. The install fails with it.
    fn on_asset_failed(&self, _url: &str, _error: &str) {}

    /// Called after every asset has been committed to the cache.
    fn on_install_complete(&self, _stats: &InstallStats) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl InstallProgress for NoProgress {}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, install not attempted yet.
    Parsed,
    /// Install in progress.
    Installing,
    /// Install succeeded; fetches are intercepted.
    Installed,
    /// The last install attempt failed.
    Failed,
}

/// How a fetch event was answered.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The live network response, unchanged.
    Network(Response),
    /// The network failed and a cached response matched.
    Cache(Response),
    /// The network failed and nothing matched; carries the network error.
    Unresolved(Error),
}

impl FetchOutcome {
    /// Short label for logs and CLI output.
    #[must_use]
    pub const fn source(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Cache(_) => "cache",
            Self::Unresolved(_) => "unresolved",
        }
    }

    /// The response, if there is one.
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Network(r) | Self::Cache(r) => Some(r),
            Self::Unresolved(_) => None,
        }
    }
}

/// Fetches one asset for the install batch.
async fn fetch_asset<N: Network + ?Sized>(
    network: &N,
    url: &Url,
    progress: &dyn InstallProgress,
) -> Result<CacheEntry> {
    let request = Request::get(url.clone());
    let result = match network.fetch(&request).await {
        Ok(resp) if resp.is_ok() => Ok(resp),
        Ok(resp) => Err(Error::AssetStatus {
            url: url.to_string(),
            status: resp.status,
        }),
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => {
            progress.on_asset_fetched(url.as_str(), response.body.len() as u64);
            Ok(CacheEntry {
                key: request.cache_key(),
                response,
            })
        }
        Err(e) => {
            progress.on_asset_failed(url.as_str(), &e.to_string());
            Err(e)
        }
    }
}

/// Opens the configured cache and stores every configured asset in it.
///
/// All assets are fetched before anything is written; the first failed fetch
/// (transport error or non-2xx status) fails the install and leaves the cache
/// as it was. Assets already present are overwritten.
///
/// # Errors
///
/// Returns an error if an asset cannot be resolved or fetched, the list
/// contains duplicates, or the storage fails.
pub async fn install<N, S>(
    config: &WorkerConfig,
    storage: &S,
    network: &N,
    progress: &dyn InstallProgress,
) -> Result<InstallStats>
where
    N: Network + ?Sized,
    S: CacheStorage + ?Sized,
{
    let start = Instant::now();
    let assets = config.resolve_assets()?;
    let cache = cache::open(storage, &config.cache_name).await?;

    let mut seen = HashSet::new();
    if let Some(dup) = assets.iter().find(|url| !seen.insert(cache_key(url))) {
        return Err(Error::DuplicateAsset(dup.to_string()));
    }

    progress.on_install_start(cache.name(), assets.len());

    let entries: Vec<CacheEntry> = stream::iter(&assets)
        .map(|url| fetch_asset(network, url, progress))
        .buffered(config.concurrent_fetches.max(1))
        .try_collect()
        .await?;

    let total_bytes = entries.iter().map(|e| e.response.body.len() as u64).sum();
    let count = entries.len();
    cache.put_all(entries).await?;

    let stats = InstallStats {
        cache_name: config.cache_name.clone(),
        assets: count,
        total_bytes,
        elapsed: start.elapsed(),
    };
    progress.on_install_complete(&stats);
    Ok(stats)
}

/// Answers one intercepted request: network first, cache on failure.
///
/// On a network success the cache is opened but nothing is written, so
/// responses fetched after install never enter the cache. A failure while
/// opening it takes the same fallback path as a network failure.
///
/// # Errors
///
/// Returns an error only if the fallback cache lookup itself fails.
pub async fn respond<N, S>(
    cache_name: &str,
    request: &Request,
    storage: &S,
    network: &N,
) -> Result<FetchOutcome>
where
    N: Network + ?Sized,
    S: CacheStorage + ?Sized,
{
    let live = async {
        let response = network.fetch(request).await?;
        cache::open(storage, cache_name).await?;
        Ok::<_, Error>(response)
    }
    .await;

    match live {
        Ok(response) => Ok(FetchOutcome::Network(response)),
        Err(e) => {
            log::debug!("Network failed for {}, trying cache: {e}", request.url);
            Ok(match cache::match_any(storage, request).await? {
                Some(cached) => FetchOutcome::Cache(cached),
                None => FetchOutcome::Unresolved(e),
            })
        }
    }
}

/// A worker bound to one configuration, network and storage.
pub struct Worker<N: Network = HttpNetwork, S: CacheStorage = DiskStorage> {
    config: WorkerConfig,
    network: N,
    storage: S,
    state: Mutex<WorkerState>,
    stats: FetchStats,
}

impl Worker<HttpNetwork, DiskStorage> {
    /// Creates a worker with a real network and on-disk storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.worker.validate()?;
        Ok(Self::new(
            config.worker.clone(),
            HttpNetwork::new()?,
            DiskStorage::new(&config.paths.cache_dir),
        ))
    }
}

impl<N: Network, S: CacheStorage> Worker<N, S> {
    /// Creates a worker in the [`WorkerState::Parsed`] state.
    #[must_use]
    pub fn new(config: WorkerConfig, network: N, storage: S) -> Self {
        Self {
            config,
            network,
            storage,
            state: Mutex::new(WorkerState::Parsed),
            stats: FetchStats::new(),
        }
    }

    /// Returns the worker configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the cache storage.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns the fetch counters.
    #[must_use]
    pub const fn stats(&self) -> &FetchStats {
        &self.stats
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    /// Runs the install handler and moves to `Installed` or `Failed`.
    ///
    /// An installed worker keeps intercepting fetches while it re-installs,
    /// and stays `Installed` if the re-install fails.
    ///
    /// # Errors
    ///
    /// Returns the install failure. A worker that was not installed is left
    /// in `Failed` and may be installed again.
    pub async fn install(&self, progress: &dyn InstallProgress) -> Result<InstallStats> {
        let was_installed = self.state() == WorkerState::Installed;
        if !was_installed {
            self.set_state(WorkerState::Installing);
        }
        match install(&self.config, &self.storage, &self.network, progress).await {
            Ok(stats) => {
                self.set_state(WorkerState::Installed);
                log::info!(
                    "Installed {} asset(s) into {} ({} bytes)",
                    stats.assets,
                    stats.cache_name,
                    stats.total_bytes
                );
                Ok(stats)
            }
            Err(e) if was_installed => {
                log::warn!("Re-install failed, keeping the installed cache: {e}");
                Err(e)
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                log::error!("Install failed: {e}");
                Err(e)
            }
        }
    }

    /// Dispatches a fetch event.
    ///
    /// Requests are intercepted only when the worker is installed and the
    /// URL is in scope; anything else goes straight to the network as if no
    /// worker were present.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback cache lookup fails.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
        if self.state() != WorkerState::Installed || !self.config.in_scope(&request.url) {
            self.stats.record_passthrough();
            return Ok(match self.network.fetch(request).await {
                Ok(resp) => FetchOutcome::Network(resp),
                Err(e) => FetchOutcome::Unresolved(e),
            });
        }

        let outcome =
            respond(&self.config.cache_name, request, &self.storage, &self.network).await?;
        match &outcome {
            FetchOutcome::Network(_) => self.stats.record_network(),
            FetchOutcome::Cache(_) => {
                log::info!("Served {} from cache", request.url);
                self.stats.record_cache();
            }
            FetchOutcome::Unresolved(e) => {
                log::warn!("No cached response for {}: {e}", request.url);
                self.stats.record_unresolved();
            }
        }
        Ok(outcome)
    }
}
