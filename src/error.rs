//! Error types for the offline-sw library.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while installing or serving through the worker.
#[derive(Error, Debug)]
pub enum Error {
    /// The network request could not be completed (offline, refused, reset).
    #[error("network request to {url} failed: {reason}")]
    Network {
        /// URL that was requested.
        url: String,
        /// Transport-level reason reported by the network layer.
        reason: String,
    },

    /// An asset answered with a non-success status during install.
    #[error("asset {url} returned status {status}")]
    AssetStatus {
        /// URL of the asset.
        url: String,
        /// HTTP status code received.
        status: u16,
    },

    /// The asset list names the same URL twice.
    #[error("duplicate asset in install list: {0}")]
    DuplicateAsset(String),

    /// A URL or path could not be parsed or resolved against the origin.
    #[error("invalid URL {input:?}: {reason}")]
    InvalidUrl {
        /// The offending input.
        input: String,
        /// Parser message.
        reason: String,
    },

    /// A write targeted a cache that was never opened.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// On-disk cache data could not be interpreted.
    #[error("corrupt cache data at {}: {reason}", path.display())]
    CorruptCache {
        /// Path of the unreadable file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error during storage or server operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache index (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Configuration could not be rendered.
    #[error("TOML render error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// HTTP client construction or protocol error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true for failures of the network itself, the kind the fetch
    /// handler recovers from by consulting the cache.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Http(_))
    }
}

/// A specialized `Result` type for offline-sw operations.
pub type Result<T> = std::result::Result<T, Error>;
