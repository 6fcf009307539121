//! Shared error types used across dataset-sync crates.

use thiserror::Error;

/// Path-related errors shared across crates.
#[derive(Debug, Error, Clone)]
pub enum PathError {
    /// Path is outside the expected root directory.
    #[error("Path is outside root: {path} not in {root}")]
    PathOutsideRoot {
        /// The path that was checked.
        path: String,
        /// The root directory it should be within.
        root: String,
    },

    /// Path is invalid or malformed.
    #[error("Invalid path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: String,
    },

    /// IO error occurred while accessing path.
    #[error("IO error at {path}: {message}")]
    IoError {
        /// Path where error occurred.
        path: String,
        /// Error message.
        message: String,
    },
}

impl PathError {
    /// Create an IoError from std::io::Error.
    ///
    /// # Arguments
    /// * `path` - Path where the error occurred
    /// * `err` - The underlying IO error
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors raised while loading [`SyncSettings`](crate::SyncSettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid JSON for the settings schema.
    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A setting has a value that cannot be used.
    #[error("Invalid setting {name}: {message}")]
    Invalid { name: &'static str, message: String },
}
