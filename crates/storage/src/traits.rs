//! Low-level object store interface used by unmanaged backends.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageError;

/// Information about a remote object from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds).
    pub last_modified: Option<i64>,
    /// ETag, used as the object's change token.
    pub etag: Option<String>,
}

/// Read-only bucket operations - implemented by each client crate.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// List every object under a prefix.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Download an object to a local file, replacing it if present.
    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<(), StorageError>;
}
