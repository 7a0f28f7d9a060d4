//! offline-sw - an offline-first caching worker.
//!
//! On install the worker opens a named cache and stores a fixed list of
//! assets in it, all or nothing. Every intercepted request afterwards goes to
//! the network first; only when the network fails is the cache consulted.
//! Responses fetched after install are never written back to the cache.
//!
//! # Example
//!
//! ```no_run
//! use offline_sw::{HttpNetwork, MemoryStorage, NoProgress, Request, Worker, WorkerConfig};
//!
//! # async fn example() -> offline_sw::Result<()> {
//! let config = WorkerConfig::new().with_origin("http://127.0.0.1:8000");
//! let worker = Worker::new(config, HttpNetwork::new()?, MemoryStorage::new());
//!
//! // Pre-cache the asset list
//! let stats = worker.install(&NoProgress).await?;
//! println!("Cached {} assets", stats.assets);
//!
//! // Network first, cache on failure
//! let url = worker.config().resolve("/static/images/favicon.ico")?;
//! let outcome = worker.handle_fetch(&Request::get(url)).await?;
//! println!("Answered from {}", outcome.source());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod stats;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

// Re-export main types for convenience
pub use cache::{Cache, CacheEntry, CacheStorage, DiskStorage, MemoryStorage, match_any};
pub use config::{AppConfig, PathConfig, ServerConfig, WorkerConfig};
pub use error::{Error, Result};
pub use http::{RedirectMode, Request, Response};
pub use network::{HttpNetwork, Network, OfflineNetwork};
pub use stats::{FetchCounts, FetchStats, InstallStats};
pub use worker::{FetchOutcome, InstallProgress, NoProgress, Worker, WorkerState, install, respond};
