//! Error types for background hashing.

use dataset_sync_manifest::ManifestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Could not dispatch job {job_id}: {message}")]
    Dispatch { job_id: usize, message: String },

    #[error("Unknown job handle: {handle}")]
    UnknownJob { handle: String },

    #[error("I/O error on {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload transaction cancelled")]
    Cancelled,
}

impl JobError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        JobError::IoError {
            path: path.display().to_string(),
            source,
        }
    }
}
