//! AWS SDK bucket client for dataset sync.
//!
//! This crate provides a `StorageClient` implementation using the AWS SDK
//! for Rust, and `default_registry` wiring it into the public bucket backend
//! next to the object service backend.
//!
//! # Example
//!
//! ```ignore
//! use dataset_sync_storage::{BackendConfigFile, S3Settings};
//! use dataset_sync_storage_crt::default_registry;
//!
//! let registry = default_registry(S3Settings::default(), &token_db).await?;
//! let backend = registry.load(&BackendConfigFile::new(&dataset_root), &runtime)?;
//! ```

mod client;
mod error;
mod registry;

pub use client::CrtStorageClient;
pub use error::CrtError;
pub use registry::default_registry;
