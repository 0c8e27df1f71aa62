//! Filesystem mirror of remote buckets.
//!
//! `gs://bucket/path/to/object` maps to `<root>/bucket/path/to/object`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{RemoteLocation, StorageError, StorageGateway};

#[derive(Debug, Clone)]
pub struct FsBucketStorage {
    root: PathBuf,
}

impl FsBucketStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, location: &RemoteLocation) -> PathBuf {
        self.root.join(location.bucket()).join(location.path())
    }
}

#[async_trait]
impl StorageGateway for FsBucketStorage {
    async fn push(
        &self,
        local_file: &Path,
        destination: &RemoteLocation,
    ) -> Result<RemoteLocation, StorageError> {
        if fs::metadata(local_file).await.is_err() {
            return Err(StorageError::LocalFileNotFound {
                path: local_file.to_path_buf(),
            });
        }

        let target = self.object_path(destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(destination, e))?;
        }

        let bytes = fs::copy(local_file, &target)
            .await
            .map_err(|e| StorageError::io(destination, e))?;
        debug!(location = %destination, bytes, "Pushed object");

        Ok(destination.clone())
    }

    async fn exists(&self, location: &RemoteLocation) -> Result<bool, StorageError> {
        match fs::metadata(self.object_path(location)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(location, e)),
        }
    }

    async fn delete(&self, location: &RemoteLocation) -> Result<(), StorageError> {
        match fs::remove_file(self.object_path(location)).await {
            Ok(()) => {
                debug!(location = %location, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(location, e)),
        }
    }

    async fn read(&self, location: &RemoteLocation) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.object_path(location)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                location: location.to_string(),
            }),
            Err(e) => Err(StorageError::io(location, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loc(s: &str) -> RemoteLocation {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_push_then_read() {
        let root = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let local = src.path().join("cluster.txt");
        tokio::fs::write(&local, b"NAME\tX\tY\n").await.unwrap();

        let storage = FsBucketStorage::new(root.path());
        let dest = loc("gs://fc-1234/uploads/cluster.txt");

        assert!(!storage.exists(&dest).await.unwrap());
        let pushed = storage.push(&local, &dest).await.unwrap();
        assert_eq!(pushed, dest);
        assert!(storage.exists(&dest).await.unwrap());
        assert_eq!(storage.read(&dest).await.unwrap(), b"NAME\tX\tY\n");
        assert!(root.path().join("fc-1234/uploads/cluster.txt").exists());
    }

    #[tokio::test]
    async fn test_push_missing_local_file() {
        let root = TempDir::new().unwrap();
        let storage = FsBucketStorage::new(root.path());
        let result = storage
            .push(Path::new("/nonexistent/file.txt"), &loc("gs://fc-1234/file.txt"))
            .await;
        assert!(matches!(result, Err(StorageError::LocalFileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let root = TempDir::new().unwrap();
        let storage = FsBucketStorage::new(root.path());
        let dest = loc("gs://fc-1234/matrix.tsv");

        storage.delete(&dest).await.unwrap();

        let path = root.path().join("fc-1234/matrix.tsv");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"GENE").await.unwrap();
        storage.delete(&dest).await.unwrap();
        assert!(!storage.exists(&dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing() {
        let root = TempDir::new().unwrap();
        let storage = FsBucketStorage::new(root.path());
        let result = storage.read(&loc("gs://fc-1234/missing.txt")).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }
}
