//! Error types for filesystem operations.

use dataset_sync_common::PathError;
use thiserror::Error;

/// Errors raised while walking, fingerprinting or hashing dataset files.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// IO error while accessing a path.
    #[error("IO error at {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Path normalization failed.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A glob pattern could not be compiled.
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidGlobPattern { pattern: String, reason: String },

    /// The fingerprint sidecar could not be written.
    #[error("Failed to write fingerprint file {path}: {message}")]
    FingerprintWrite { path: String, message: String },

    /// A blocking hash task panicked or was cancelled.
    #[error("Hash task for {path} did not complete: {message}")]
    HashTask { path: String, message: String },
}

impl FileSystemError {
    /// Build an `IoError` for the given path.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::IoError { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
