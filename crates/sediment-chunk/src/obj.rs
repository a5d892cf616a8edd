//! Blob-backend abstraction
//!
//! `ObjClient` is the byte-range get/put/delete boundary beneath chunk
//! storage. The in-memory client backs tests and the GC test harness; the
//! local client stores one file per key under a root directory.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sediment_common::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte storage keyed by string, beneath the chunk layer.
#[async_trait]
pub trait ObjClient: Send + Sync {
    /// Store `data` under `key`. Overwrites are allowed; all writers of a
    /// given key store identical content, so the result is the same.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch the bytes stored under `key`, or a not-found error.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`, in lexicographic order.
    async fn walk(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory blob client
#[derive(Default)]
pub struct MemObjClient {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemObjClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for test wiring
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored objects (test observability for dedup)
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total stored footprint in bytes
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.objects.read().values().map(Bytes::len).sum()
    }
}

#[async_trait]
impl ObjClient for MemObjClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn walk(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Local-filesystem blob client: one file per key under `root`, with a
/// two-character fan-out directory to keep directories small.
pub struct LocalObjClient {
    root: PathBuf,
}

impl LocalObjClient {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let fan_out = if key.len() >= 2 { &key[..2] } else { "__" };
        self.root.join(fan_out).join(key)
    }
}

#[async_trait]
impl ObjClient for LocalObjClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crashed put never leaves a partial object
        // visible under the final key.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ChunkNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.key_path(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn walk(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_client_round_trip() {
        let client = MemObjClient::new();
        client.put("abc", Bytes::from_static(b"data")).await.unwrap();
        assert!(client.exists("abc").await.unwrap());
        assert_eq!(client.get("abc").await.unwrap(), Bytes::from_static(b"data"));

        client.delete("abc").await.unwrap();
        assert!(!client.exists("abc").await.unwrap());
        let err = client.get("abc").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_local_client_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalObjClient::new(dir.path());
        client
            .put("deadbeef", Bytes::from_static(b"chunk bytes"))
            .await
            .unwrap();
        assert!(client.exists("deadbeef").await.unwrap());
        assert_eq!(
            client.get("deadbeef").await.unwrap(),
            Bytes::from_static(b"chunk bytes")
        );

        let keys = client.walk("dead").await.unwrap();
        assert_eq!(keys, vec!["deadbeef".to_string()]);

        client.delete("deadbeef").await.unwrap();
        assert!(!client.exists("deadbeef").await.unwrap());
        // deleting again is fine
        client.delete("deadbeef").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalObjClient::new(dir.path());
        assert!(client.get("cafe").await.unwrap_err().is_not_found());
        assert!(client.walk("").await.unwrap().is_empty());
    }
}
