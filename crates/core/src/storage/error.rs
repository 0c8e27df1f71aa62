//! Error types for the storage module.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Local source file missing before push.
    #[error("Local file not found: {path}")]
    LocalFileNotFound { path: PathBuf },

    /// Object does not exist in the bucket.
    #[error("Object not found: {location}")]
    NotFound { location: String },

    /// Location string is not a valid gs:// URL.
    #[error("Invalid remote location: {0}")]
    InvalidLocation(String),

    #[error("Storage I/O error on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn io(location: impl ToString, source: std::io::Error) -> Self {
        Self::Io {
            location: location.to_string(),
            source,
        }
    }
}
