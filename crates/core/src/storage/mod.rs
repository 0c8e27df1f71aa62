//! Remote object storage collaborator.

mod error;
mod fs_bucket;
mod location;
mod traits;

pub use error::StorageError;
pub use fs_bucket::FsBucketStorage;
pub use location::RemoteLocation;
pub use traits::StorageGateway;
