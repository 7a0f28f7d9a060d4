//! Configuration for the worker, its storage and the proxy host.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::parse_url;

/// Cache name used when none is configured.
pub const DEFAULT_CACHE_NAME: &str = "django-pwa-v1";

/// Assets pre-cached on install when none are configured.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/static/images/favicon.ico",
    "/static/images/android-chrome-192x192.png",
    "/static/images/android-chrome-512x512.png",
    "/static/images/apple-touch-icon.png",
];

/// What the worker caches and which requests it intercepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the cache the install step populates.
    pub cache_name: String,
    /// Origin the worker is registered for; relative assets resolve against it.
    pub origin: String,
    /// Path prefix under the origin whose requests are intercepted.
    pub scope: String,
    /// Ordered asset list fetched on install.
    pub assets: Vec<String>,
    /// Maximum number of asset fetches in flight during install.
    pub concurrent_fetches: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            origin: "http://127.0.0.1:8000".to_string(),
            scope: "/".to_string(),
            assets: DEFAULT_ASSETS.iter().map(ToString::to_string).collect(),
            concurrent_fetches: 4,
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache name.
    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the scope path.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Replaces the asset list.
    #[must_use]
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the install fetch concurrency.
    #[must_use]
    pub const fn with_concurrent_fetches(mut self, concurrent: usize) -> Self {
        self.concurrent_fetches = concurrent;
        self
    }

    /// Parses the configured origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url> {
        parse_url(&self.origin)
    }

    /// Resolves `input` (absolute, or relative to the origin) into a URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin or `input` cannot be parsed.
    pub fn resolve(&self, input: &str) -> Result<Url> {
        self.origin_url()?
            .join(input)
            .map_err(|e| Error::InvalidUrl {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Resolves every asset against the origin, keeping list order.
    ///
    /// # Errors
    ///
    /// Returns an error for the first asset that cannot be resolved.
    pub fn resolve_assets(&self) -> Result<Vec<Url>> {
        self.assets.iter().map(|a| self.resolve(a)).collect()
    }

    /// Returns true if `url` is same-origin and under the scope path.
    #[must_use]
    pub fn in_scope(&self, url: &Url) -> bool {
        let Ok(origin) = self.origin_url() else {
            return false;
        };
        url.origin() == origin.origin() && url.path().starts_with(&self.scope)
    }

    /// Checks the values that would make the worker unusable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(Error::Config("cache_name must not be empty".into()));
        }
        if self.concurrent_fetches == 0 {
            return Err(Error::Config("concurrent_fetches must be at least 1".into()));
        }
        if !self.scope.starts_with('/') {
            return Err(Error::Config(format!(
                "scope {:?} must start with '/'",
                self.scope
            )));
        }
        self.resolve_assets()?;
        Ok(())
    }
}

/// Where caches are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root directory of the persistent cache storage.
    pub cache_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

/// Returns the directory where caches are stored by default.
///
/// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is
/// configured), falling back to `$XDG_DATA_HOME/offline-sw` for interactive
/// use.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("STATE_DIRECTORY").map_or_else(
        || {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offline-sw")
                .join("caches")
        },
        |dir| PathBuf::from(dir).join("caches"),
    )
}

/// Proxy host settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// How many times the host attempts install before giving up.
    pub install_attempts: u32,
    /// Delay between install attempts, in seconds.
    pub install_retry_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            install_attempts: 3,
            install_retry_delay_secs: 5,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Storage paths.
    pub paths: PathConfig,
    /// Proxy host settings.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-sw")
            .join("config.toml")
    }

    /// Loads configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads configuration from `path`, writing a default template first if
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be written or the file cannot
    /// be parsed.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            log::info!("Wrote default configuration to {}", path.display());
            return Ok(config);
        }
        Self::load(path)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
