use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::StorageError;

static GS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^gs://([a-z0-9][a-z0-9._-]{1,61}[a-z0-9])/(\S+)$").expect("valid gs url regex")
});

/// An object in a remote bucket, written as `gs://bucket/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteLocation {
    bucket: String,
    path: String,
}

impl RemoteLocation {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Result<Self, StorageError> {
        format!("gs://{}/{}", bucket.into(), path.into()).parse()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A sibling object under the same bucket.
    pub fn join(&self, suffix: &str) -> Result<Self, StorageError> {
        Self::new(
            self.bucket.clone(),
            format!("{}/{}", self.path.trim_end_matches('/'), suffix),
        )
    }
}

impl FromStr for RemoteLocation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = GS_URL
            .captures(s)
            .ok_or_else(|| StorageError::InvalidLocation(s.to_string()))?;
        let path = &caps[2];
        if path.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidLocation(s.to_string()));
        }
        Ok(Self {
            bucket: caps[1].to_string(),
            path: path.to_string(),
        })
    }
}

impl TryFrom<String> for RemoteLocation {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RemoteLocation> for String {
    fn from(location: RemoteLocation) -> Self {
        location.to_string()
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}
