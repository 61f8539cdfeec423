//! Directory-backed storage connector
//!
//! Stores every resource as a file directly under a base directory. Useful
//! for local deployments and for mounting remote filesystems as backends.

use crate::connector::{validate_resource, ConnectorStats, Result, StorageConnector, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Storage connector writing resources to a local directory
pub struct DirectoryConnector {
    name: String,
    root: PathBuf,
    connected: AtomicBool,
    puts: AtomicU64,
    updates: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    /// Suffix source for temporary files
    temp_seq: AtomicU64,
}

impl DirectoryConnector {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            connected: AtomicBool::new(false),
            puts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            temp_seq: AtomicU64::new(0),
        }
    }

    /// Base directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, resource: &str) -> Result<PathBuf> {
        validate_resource(resource)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::NotConnected {
                connector: self.name.clone(),
            });
        }
        Ok(self.root.join(resource))
    }

    /// Write through a temporary file so readers never see partial content.
    /// Each write gets its own temporary file.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".{}.part", seq));
        let tmp = PathBuf::from(tmp);

        let written = match tokio::fs::write(&tmp, data).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageConnector for DirectoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(connector = %self.name, root = %self.root.display(), "Directory connector ready");
        Ok(())
    }

    async fn put(&self, resource: &str, data: Bytes) -> Result<()> {
        let path = self.resource_path(resource)?;
        self.write_atomic(&path, &data).await?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, resource: &str) -> Result<Option<Bytes>> {
        let path = self.resource_path(resource)?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, resource: &str) -> Result<()> {
        let path = self.resource_path(resource)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, resource: &str, data: Bytes) -> Result<()> {
        let path = self.resource_path(resource)?;
        self.write_atomic(&path, &data).await?;
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        let (mut resources, mut bytes_stored) = (0, 0);
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        resources += 1;
                        bytes_stored += meta.len();
                    }
                }
            }
        }
        ConnectorStats {
            resources,
            bytes_stored,
            puts: self.puts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_creates_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("backend0");
        let conn = DirectoryConnector::new("dir0", &root);
        conn.connect().await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let conn = DirectoryConnector::new("dir0", dir.path());
        conn.connect().await.unwrap();

        conn.put("abc.1", Bytes::from_static(b"shard")).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("abc.1")).unwrap(),
            b"shard".to_vec()
        );
        assert_eq!(
            conn.get("abc.1").await.unwrap(),
            Some(Bytes::from_static(b"shard"))
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        conn.delete("abc.1").await.unwrap();
        conn.delete("abc.1").await.unwrap();
        assert_eq!(conn.get("abc.1").await.unwrap(), None);
        assert_eq!(conn.stats().resources, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writes_publish_whole_content() {
        let dir = TempDir::new().unwrap();
        let conn = Arc::new(DirectoryConnector::new("dir0", dir.path()));
        conn.connect().await.unwrap();

        let payloads: Vec<Bytes> = (0..8u8).map(|i| Bytes::from(vec![i; 256 * 1024])).collect();
        let writes = payloads.iter().cloned().map(|data| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.update("abc.0", data).await })
        });
        for handle in writes.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }

        let stored = conn.get("abc.0").await.unwrap().unwrap();
        assert!(payloads.contains(&stored));
        // no temporary files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let conn = DirectoryConnector::new("dir0", dir.path());
        conn.connect().await.unwrap();
        let err = conn.put("../escape", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource(_)));
    }
}
