//! In-process cache storage.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};
use crate::http::Response;

#[derive(Debug)]
struct NamedCache {
    name: String,
    entries: Vec<CacheEntry>,
}

/// Cache storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    caches: Mutex<Vec<NamedCache>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_caches<T>(&self, f: impl FnOnce(&mut Vec<NamedCache>) -> T) -> T {
        // Every mutation below is a single step, so a poisoned lock still
        // guards consistent data.
        let mut guard = self
            .caches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn create(&self, name: &str) -> Result<bool> {
        Ok(self.with_caches(|caches| {
            if caches.iter().any(|c| c.name == name) {
                false
            } else {
                caches.push(NamedCache {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                true
            }
        }))
    }

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.with_caches(|caches| caches.iter().any(|c| c.name == name)))
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.with_caches(|caches| caches.iter().map(|c| c.name.clone()).collect()))
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<Response>> {
        Ok(self.with_caches(|caches| {
            caches
                .iter()
                .find(|c| c.name == name)
                .and_then(|c| c.entries.iter().find(|e| e.key == key))
                .map(|e| e.response.clone())
        }))
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        self.with_caches(|caches| {
            let cache = caches
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
            for entry in entries {
                cache.entries.retain(|e| e.key != entry.key);
                cache.entries.push(entry);
            }
            Ok(())
        })
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.with_caches(|caches| {
            caches
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.entries.iter().map(|e| e.key.clone()).collect())
                .unwrap_or_default()
        }))
    }
}
