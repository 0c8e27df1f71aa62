//! Mock bucket storage for testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::storage::{RemoteLocation, StorageError, StorageGateway};

/// In-memory [`StorageGateway`].
///
/// Objects are keyed by their `gs://` URL. Pushes do not touch the local
/// filesystem; the local path is only recorded.
#[derive(Debug, Default)]
pub struct MockStorage {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    pushed: Arc<RwLock<Vec<(PathBuf, String)>>>,
    deleted: Arc<RwLock<Vec<String>>>,
    /// Number of upcoming pushes that fail.
    failing_pushes: Arc<RwLock<u32>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as if it had been uploaded earlier.
    pub async fn insert_object(&self, location: &str, bytes: &[u8]) {
        self.objects
            .write()
            .await
            .insert(location.to_string(), bytes.to_vec());
    }

    pub async fn contains(&self, location: &str) -> bool {
        self.objects.read().await.contains_key(location)
    }

    /// `(local path, destination)` of every successful push.
    pub async fn pushed(&self) -> Vec<(PathBuf, String)> {
        self.pushed.read().await.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.read().await.clone()
    }

    /// Make the next `count` pushes fail with an I/O error.
    pub async fn fail_pushes(&self, count: u32) {
        *self.failing_pushes.write().await = count;
    }
}

#[async_trait]
impl StorageGateway for MockStorage {
    async fn push(
        &self,
        local_file: &Path,
        destination: &RemoteLocation,
    ) -> Result<RemoteLocation, StorageError> {
        {
            let mut failing = self.failing_pushes.write().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(StorageError::Io {
                    location: destination.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "simulated outage"),
                });
            }
        }

        self.objects
            .write()
            .await
            .insert(destination.to_string(), Vec::new());
        self.pushed
            .write()
            .await
            .push((local_file.to_path_buf(), destination.to_string()));
        Ok(destination.clone())
    }

    async fn exists(&self, location: &RemoteLocation) -> Result<bool, StorageError> {
        Ok(self.contains(&location.to_string()).await)
    }

    async fn delete(&self, location: &RemoteLocation) -> Result<(), StorageError> {
        let key = location.to_string();
        self.objects.write().await.remove(&key);
        self.deleted.write().await.push(key);
        Ok(())
    }

    async fn read(&self, location: &RemoteLocation) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(&location.to_string())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                location: location.to_string(),
            })
    }
}
