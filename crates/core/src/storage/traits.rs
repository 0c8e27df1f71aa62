use std::path::Path;

use async_trait::async_trait;

use super::{RemoteLocation, StorageError};

/// Remote object storage used for job inputs and outputs.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Upload a local file to `destination`.
    async fn push(
        &self,
        local_file: &Path,
        destination: &RemoteLocation,
    ) -> Result<RemoteLocation, StorageError>;

    async fn exists(&self, location: &RemoteLocation) -> Result<bool, StorageError>;

    /// Remove an object. Deleting a missing object is not an error.
    async fn delete(&self, location: &RemoteLocation) -> Result<(), StorageError>;

    async fn read(&self, location: &RemoteLocation) -> Result<Vec<u8>, StorageError>;
}
