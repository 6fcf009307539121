//! Error types for the AWS SDK bucket client.

use dataset_sync_storage::StorageError;
use thiserror::Error;

/// Errors specific to the AWS SDK bucket client.
#[derive(Error, Debug)]
pub enum CrtError {
    /// AWS SDK error.
    #[error("AWS SDK error: {message}")]
    SdkError { message: String, retryable: bool },

    /// Object key absent from the bucket.
    #[error("No such key: s3://{bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// I/O error while writing a downloaded object.
    #[error("I/O error on {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CrtError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        CrtError::IoError {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<CrtError> for StorageError {
    fn from(err: CrtError) -> Self {
        match err {
            CrtError::SdkError { message, retryable } => {
                StorageError::NetworkError { message, retryable }
            }
            CrtError::NoSuchKey { bucket, key } => StorageError::NotFound { bucket, key },
            CrtError::IoError { path, source } => StorageError::IoError {
                path,
                message: source.to_string(),
            },
        }
    }
}
