//! Persistent cache storage on the local file system.
//!
//! Layout under the storage root:
//!
//! ```text
//! <sha256(cache name)>/
//!     index.json      name, creation time, ordered entry metadata
//!     bodies/<uuid>   one file per stored response body
//! ```
//!
//! Writes go body files first and index last. Replacing `index.json` (write
//! tmp + rename) is the commit point of a batch, so a failed batch leaves the
//! previously committed index untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};
use crate::http::Response;

const INDEX_FILE: &str = "index.json";
const BODIES_DIR: &str = "bodies";
/// Index reads attempted by `get` when commits keep replacing the body.
const STALE_READ_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    body_file: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    name: String,
    created: DateTime<Utc>,
    entries: Vec<StoredEntry>,
}

/// Cache storage that survives restarts.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Creates a storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory of this storage.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        let digest = Sha256::digest(name.as_bytes());
        self.root.join(hex::encode(&digest[..16]))
    }

    async fn read_index(dir: &Path) -> Result<Option<CacheIndex>> {
        let path = dir.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| Error::CorruptCache {
                    path,
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(dir: &Path, index: &CacheIndex) -> Result<()> {
        let path = dir.join(INDEX_FILE);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Writes every body of the batch, removing what was written if any
    /// write fails.
    async fn write_bodies(bodies_dir: &Path, entries: &[CacheEntry]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let file = uuid::Uuid::new_v4().to_string();
            if let Err(e) = tokio::fs::write(bodies_dir.join(&file), &entry.response.body).await {
                for f in &written {
                    let _ = tokio::fs::remove_file(bodies_dir.join(f)).await;
                }
                return Err(e.into());
            }
            written.push(file);
        }
        Ok(written)
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn create(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let dir = self.cache_dir(name);
        if Self::read_index(&dir).await?.is_some() {
            return Ok(false);
        }
        tokio::fs::create_dir_all(dir.join(BODIES_DIR)).await?;
        let index = CacheIndex {
            name: name.to_string(),
            created: Utc::now(),
            entries: Vec::new(),
        };
        Self::write_index(&dir, &index).await?;
        Ok(true)
    }

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.cache_dir(name).join(INDEX_FILE)).await?)
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut caches = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::read_index(&entry.path()).await {
                Ok(Some(index)) => caches.push((index.created, index.name)),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable cache: {e}"),
            }
        }

        caches.sort();
        Ok(caches.into_iter().map(|(_, name)| name).collect())
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<Response>> {
        let dir = self.cache_dir(name);
        let mut attempt = 1;
        loop {
            let Some(index) = Self::read_index(&dir).await? else {
                return Ok(None);
            };
            let Some(entry) = index.entries.into_iter().find(|e| e.key == key) else {
                return Ok(None);
            };

            let body_path = dir.join(BODIES_DIR).join(&entry.body_file);
            match tokio::fs::read(&body_path).await {
                Ok(body) => {
                    return Ok(Some(Response {
                        url: entry.url,
                        status: entry.status,
                        headers: entry.headers,
                        body: body.into(),
                    }));
                }
                // A commit between reading the index and the body removes the
                // body it pointed at; the new index names its replacement.
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        && attempt < STALE_READ_ATTEMPTS =>
                {
                    log::debug!("Body for {key} replaced during read, re-reading index");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::CorruptCache {
                        path: body_path,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.cache_dir(name);
        let mut index = Self::read_index(&dir)
            .await?
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;

        let bodies_dir = dir.join(BODIES_DIR);
        tokio::fs::create_dir_all(&bodies_dir).await?;
        let files = Self::write_bodies(&bodies_dir, &entries).await?;

        let now = Utc::now();
        let mut replaced = Vec::new();
        for (entry, body_file) in entries.into_iter().zip(files.iter()) {
            if let Some(pos) = index.entries.iter().position(|e| e.key == entry.key) {
                replaced.push(index.entries.remove(pos).body_file);
            }
            index.entries.push(StoredEntry {
                key: entry.key,
                url: entry.response.url,
                status: entry.response.status,
                headers: entry.response.headers,
                size: entry.response.body.len() as u64,
                body_file: body_file.clone(),
                stored_at: now,
            });
        }

        if let Err(e) = Self::write_index(&dir, &index).await {
            for f in &files {
                let _ = tokio::fs::remove_file(bodies_dir.join(f)).await;
            }
            return Err(e);
        }

        for f in replaced {
            if let Err(e) = tokio::fs::remove_file(bodies_dir.join(&f)).await {
                log::debug!("Could not remove replaced body {f}: {e}");
            }
        }
        Ok(())
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>> {
        Ok(Self::read_index(&self.cache_dir(name))
            .await?
            .map(|index| index.entries.into_iter().map(|e| e.key).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn entry(key: &str, body: &'static str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            response: Response {
                url: key.to_string(),
                status: 200,
                headers: vec![("content-type".into(), "image/png".into())],
                body: Bytes::from_static(body.as_bytes()),
            },
        }
    }

    fn body_count(storage: &DiskStorage, name: &str) -> usize {
        std::fs::read_dir(storage.cache_dir(name).join(BODIES_DIR))
            .unwrap()
            .count()
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = DiskStorage::new(dir.path());
            assert!(storage.create("django-pwa-v1").await.unwrap());
            storage
                .put_all(
                    "django-pwa-v1",
                    vec![
                        entry("http://localhost/a.png", "a"),
                        entry("http://localhost/b.png", "b"),
                    ],
                )
                .await
                .unwrap();
        }

        let storage = DiskStorage::new(dir.path());
        assert!(!storage.create("django-pwa-v1").await.unwrap());
        assert_eq!(
            storage.keys("django-pwa-v1").await.unwrap(),
            vec!["http://localhost/a.png", "http://localhost/b.png"]
        );
        let a = storage
            .get("django-pwa-v1", "http://localhost/a.png")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.body, Bytes::from_static(b"a"));
        assert_eq!(a.header("Content-Type"), Some("image/png"));
    }

    #[tokio::test]
    async fn overwrite_removes_old_body() {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        storage.create("v1").await.unwrap();
        storage.put_all("v1", vec![entry("/a", "one")]).await.unwrap();
        storage.put_all("v1", vec![entry("/a", "two")]).await.unwrap();

        assert_eq!(storage.keys("v1").await.unwrap(), vec!["/a"]);
        assert_eq!(body_count(&storage, "v1"), 1);
        let a = storage.get("v1", "/a").await.unwrap().unwrap();
        assert_eq!(a.body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn put_all_into_unknown_cache_fails() {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        let err = storage.put_all("v1", vec![entry("/a", "a")]).await.unwrap_err();
        assert!(matches!(err, Error::CacheNotFound(_)));
        assert!(!storage.contains("v1").await.unwrap());
    }

    #[tokio::test]
    async fn names_follow_creation_order() {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        assert!(storage.names().await.unwrap().is_empty());

        storage.create("first").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage.create("second").await.unwrap();
        assert_eq!(storage.names().await.unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn corrupt_index_is_reported() {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        storage.create("v1").await.unwrap();
        std::fs::write(storage.cache_dir("v1").join(INDEX_FILE), b"{ not json").unwrap();

        let err = storage.get("v1", "/a").await.unwrap_err();
        assert!(matches!(err, Error::CorruptCache { .. }));
        // Listing skips it rather than failing.
        assert!(storage.names().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_stay_consistent_while_entries_are_replaced() {
        let dir = TempDir::new().unwrap();
        let storage = std::sync::Arc::new(DiskStorage::new(dir.path()));
        storage.create("v1").await.unwrap();
        storage.put_all("v1", vec![entry("/a", "a")]).await.unwrap();

        let writer = {
            let storage = std::sync::Arc::clone(&storage);
            tokio::spawn(async move {
                for _ in 0..200 {
                    storage.put_all("v1", vec![entry("/a", "a")]).await.unwrap();
                }
            })
        };

        loop {
            let a = storage.get("v1", "/a").await.unwrap().unwrap();
            assert_eq!(a.body, Bytes::from_static(b"a"));
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();
        assert_eq!(body_count(&storage, "v1"), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_body_write_leaves_committed_entries() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        storage.create("v1").await.unwrap();
        storage.put_all("v1", vec![entry("/a", "one")]).await.unwrap();

        let bodies = storage.cache_dir("v1").join(BODIES_DIR);
        std::fs::set_permissions(&bodies, std::fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users ignore directory permissions.
        let writable = std::fs::write(bodies.join("check"), b"").is_ok();
        if writable {
            std::fs::remove_file(bodies.join("check")).unwrap();
        }

        let result = storage
            .put_all("v1", vec![entry("/a", "two"), entry("/b", "b")])
            .await;
        std::fs::set_permissions(&bodies, std::fs::Permissions::from_mode(0o755)).unwrap();
        if writable {
            return;
        }

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(storage.keys("v1").await.unwrap(), vec!["/a"]);
        let a = storage.get("v1", "/a").await.unwrap().unwrap();
        assert_eq!(a.body, Bytes::from_static(b"one"));
        assert_eq!(body_count(&storage, "v1"), 1);
    }

    #[tokio::test]
    async fn failed_index_commit_removes_new_bodies() {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(dir.path());
        storage.create("v1").await.unwrap();
        storage.put_all("v1", vec![entry("/a", "one")]).await.unwrap();

        // A directory in place of the temporary index makes the commit fail.
        let cache_dir = storage.cache_dir("v1");
        std::fs::create_dir(cache_dir.join("index.json.tmp")).unwrap();

        let err = storage
            .put_all("v1", vec![entry("/a", "two"), entry("/b", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        assert_eq!(storage.keys("v1").await.unwrap(), vec!["/a"]);
        let a = storage.get("v1", "/a").await.unwrap().unwrap();
        assert_eq!(a.body, Bytes::from_static(b"one"));
        assert!(storage.get("v1", "/b").await.unwrap().is_none());
        assert_eq!(body_count(&storage, "v1"), 1);
    }
}
