//! Error types for storage operations.

use dataset_sync_manifest::ManifestError;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Object not found in the remote store.
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Access denied.
    #[error("Access denied to {bucket}/{key}: {message}")]
    AccessDenied {
        bucket: String,
        key: String,
        message: String,
    },

    /// The remote answered a transfer with a status outside 2xx.
    #[error("Request for {key} failed with HTTP status {status}")]
    HttpStatus { key: String, status: u16 },

    /// Downloaded bytes do not hash to the expected object id.
    #[error("Hash mismatch for {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// Network error.
    #[error("Network error: {message}")]
    NetworkError { message: String, retryable: bool },

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    IoError { path: String, message: String },

    /// Operation cancelled by user.
    #[error("Operation cancelled")]
    Cancelled,

    /// Missing or invalid backend configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The manifest could not be read or updated.
    #[error("Manifest error: {message}")]
    Manifest { message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl StorageError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::NetworkError { retryable, .. } => *retryable,
            StorageError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            StorageError::NotFound { .. } => false,
            StorageError::AccessDenied { .. } => false,
            StorageError::HashMismatch { .. } => true,
            StorageError::IoError { .. } => false,
            StorageError::Cancelled => false,
            StorageError::InvalidConfig { .. } => false,
            StorageError::Manifest { .. } => false,
            StorageError::Other { .. } => false,
        }
    }

    /// Build an `IoError` for the given path.
    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        StorageError::IoError {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Build an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        StorageError::InvalidConfig {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<ManifestError> for StorageError {
    fn from(err: ManifestError) -> Self {
        StorageError::Manifest {
            message: err.to_string(),
        }
    }
}

/// Non-fatal error encountered during batch transfer.
#[derive(Debug, Clone)]
pub struct TransferError {
    /// The dataset path that failed.
    pub key: String,
    /// The error that occurred.
    pub error: StorageError,
}

impl TransferError {
    /// Create a new transfer error.
    pub fn new(key: impl Into<String>, error: StorageError) -> Self {
        Self {
            key: key.into(),
            error,
        }
    }
}
