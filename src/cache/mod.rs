//! Named response caches.
//!
//! A [`CacheStorage`] holds any number of named caches, each an ordered map
//! from request URL to [`Response`]. Callers normally go through [`open`],
//! which creates the cache when absent and hands back a [`Cache`] handle, and
//! through [`match_any`], which searches every cache the way a fallback
//! lookup does.

mod disk;
mod memory;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;
use crate::http::{Request, Response};

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

/// A response stored under the key of the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Normalized request URL.
    pub key: String,
    /// Stored response.
    pub response: Response,
}

/// Backend holding a set of named caches.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Opens `name`, creating it when absent. Returns true if it was created.
    async fn create(&self, name: &str) -> Result<bool>;

    /// Returns true if a cache called `name` exists.
    async fn contains(&self, name: &str) -> Result<bool>;

    /// Returns cache names in creation order.
    async fn names(&self) -> Result<Vec<String>>;

    /// Looks `key` up in `name`. A missing cache is simply a miss.
    async fn get(&self, name: &str, key: &str) -> Result<Option<Response>>;

    /// Stores every entry in `name`, or none of them.
    ///
    /// An entry whose key already exists replaces the old one and moves to
    /// the end of the key order.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// Returns the keys of `name` in insertion order.
    async fn keys(&self, name: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<S: CacheStorage + ?Sized> CacheStorage for std::sync::Arc<S> {
    async fn create(&self, name: &str) -> Result<bool> {
        (**self).create(name).await
    }

    async fn contains(&self, name: &str) -> Result<bool> {
        (**self).contains(name).await
    }

    async fn names(&self) -> Result<Vec<String>> {
        (**self).names().await
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<Response>> {
        (**self).get(name, key).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        (**self).put_all(name, entries).await
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>> {
        (**self).keys(name).await
    }
}

/// Handle on one opened cache.
#[derive(Debug)]
pub struct Cache<'a, S: CacheStorage + ?Sized> {
    storage: &'a S,
    name: String,
}

/// Opens the cache called `name`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the backend cannot create the cache.
pub async fn open<'a, S: CacheStorage + ?Sized>(
    storage: &'a S,
    name: &str,
) -> Result<Cache<'a, S>> {
    if storage.create(name).await? {
        log::info!("Created cache {name}");
    }
    Ok(Cache {
        storage,
        name: name.to_string(),
    })
}

impl<S: CacheStorage + ?Sized> Cache<'_, S> {
    /// Name of the cache.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the stored response for `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if request.method != Method::GET {
            return Ok(None);
        }
        self.storage.get(&self.name, &request.cache_key()).await
    }

    /// Stores `entries` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot commit the batch; nothing is
    /// stored in that case.
    pub async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<()> {
        self.storage.put_all(&self.name, entries).await
    }

    /// Returns stored keys in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.storage.keys(&self.name).await
    }
}

/// Looks `request` up across every cache, oldest first.
///
/// Only `GET` requests can match.
///
/// # Errors
///
/// Returns an error if the backend cannot be read.
pub async fn match_any<S: CacheStorage + ?Sized>(
    storage: &S,
    request: &Request,
) -> Result<Option<Response>> {
    if request.method != Method::GET {
        return Ok(None);
    }
    let key = request.cache_key();
    for name in storage.names().await? {
        if let Some(resp) = storage.get(&name, &key).await? {
            return Ok(Some(resp));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_url;
    use bytes::Bytes;

    fn entry(url: &str, body: &'static str) -> CacheEntry {
        CacheEntry {
            key: url.to_string(),
            response: Response {
                url: url.to_string(),
                status: 200,
                headers: vec![],
                body: Bytes::from_static(body.as_bytes()),
            },
        }
    }

    #[tokio::test]
    async fn open_creates_cache_once() {
        let storage = MemoryStorage::new();
        assert!(!storage.contains("v1").await.unwrap());
        let cache = open(&storage, "v1").await.unwrap();
        assert_eq!(cache.name(), "v1");
        assert!(storage.contains("v1").await.unwrap());
        open(&storage, "v1").await.unwrap();
        assert_eq!(storage.names().await.unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn match_request_ignores_fragment() {
        let storage = MemoryStorage::new();
        let cache = open(&storage, "v1").await.unwrap();
        cache
            .put_all(vec![entry("http://localhost/a.png", "a")])
            .await
            .unwrap();

        let req = Request::get(parse_url("http://localhost/a.png#x").unwrap());
        let hit = cache.match_request(&req).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn non_get_requests_never_match() {
        let storage = MemoryStorage::new();
        let cache = open(&storage, "v1").await.unwrap();
        cache
            .put_all(vec![entry("http://localhost/a.png", "a")])
            .await
            .unwrap();

        let mut req = Request::get(parse_url("http://localhost/a.png").unwrap());
        req.method = Method::POST;
        assert!(cache.match_request(&req).await.unwrap().is_none());
        assert!(match_any(&storage, &req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn match_any_prefers_oldest_cache() {
        let storage = MemoryStorage::new();
        open(&storage, "old")
            .await
            .unwrap()
            .put_all(vec![entry("http://localhost/a.png", "old")])
            .await
            .unwrap();
        open(&storage, "new")
            .await
            .unwrap()
            .put_all(vec![
                entry("http://localhost/a.png", "new"),
                entry("http://localhost/b.png", "b"),
            ])
            .await
            .unwrap();

        let a = Request::get(parse_url("http://localhost/a.png").unwrap());
        let b = Request::get(parse_url("http://localhost/b.png").unwrap());
        let c = Request::get(parse_url("http://localhost/c.png").unwrap());
        assert_eq!(
            match_any(&storage, &a).await.unwrap().unwrap().body,
            Bytes::from_static(b"old")
        );
        assert!(match_any(&storage, &b).await.unwrap().is_some());
        assert!(match_any(&storage, &c).await.unwrap().is_none());
    }
}
