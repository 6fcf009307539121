//! Error types for manifest operations.

use dataset_sync_common::PathError;
use dataset_sync_filesystem::FileSystemError;
use thiserror::Error;

/// Errors that can occur while reading, updating or persisting a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// IO error at a specific path.
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A shard, log or table on disk could not be parsed.
    #[error("Corrupt file {path}: {message}")]
    Corrupt { path: String, message: String },

    /// Writing queued changes failed. The in-memory manifest was discarded.
    #[error("Failed to persist manifest: {message}")]
    Persist { message: String },

    /// A tracked path is not in the manifest.
    #[error("Path not found in manifest: {path}")]
    NotFound { path: String },

    /// The target of a create or move already exists.
    #[error("Path already exists: {path}")]
    AlreadyExists { path: String },

    /// A path cannot be used as a manifest key.
    #[error("Invalid manifest path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    /// An update was applied for a created or modified path with no content hash.
    #[error("No content hash available for {path}")]
    MissingHash { path: String },

    /// The repository lock passed in does not belong to this dataset.
    #[error("Repository lock for dataset {expected} is not held")]
    LockNotHeld { expected: String },

    /// Another commit moved the repository after the status was taken.
    #[error("Repository moved from revision {expected} to {actual}")]
    RevisionChanged { expected: String, actual: String },

    /// The repository rejected an operation.
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// Walking, fingerprinting or hashing failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Path normalization failed.
    #[error(transparent)]
    Path(#[from] PathError),
}

impl ManifestError {
    /// Build an `Io` error for the given path.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Build a `Corrupt` error for the given path.
    pub fn corrupt(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}
