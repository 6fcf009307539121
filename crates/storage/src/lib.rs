//! Storage backends and transfer orchestration for dataset sync.
//!
//! This crate moves content objects between a dataset's local object store
//! and wherever the dataset lives remotely. It provides:
//!
//! - **Backend traits** - `StorageBackend` plus the `ManagedStorageBackend`
//!   and `UnmanagedStorageBackend` capabilities, configuration checks and a
//!   string-keyed `BackendRegistry`
//! - **Object service backend** - Managed, presigned two-phase HTTP transfers
//! - **Public bucket backend** - Unmanaged mirror of an S3 prefix, driven by
//!   a low-level `StorageClient`
//! - **IOManager** - Push frontier, batched pushes and deduplicated pulls
//!
//! # Caching
//!
//! The change-token cache records the ETag of every object an unmanaged
//! backend downloaded, so only new and changed objects are fetched again.

pub mod backend;
pub mod change_tokens;
mod error;
pub mod io_manager;
pub mod object_service;
pub mod public_bucket;
pub mod transfer;
mod traits;
mod types;

pub use backend::{
    BackendConfig, BackendConfigFile, BackendFactory, BackendRegistry, ManagedStorageBackend,
    RemoteUpdate, StorageBackend, StoredBackendConfig, UnmanagedStorageBackend,
};
pub use change_tokens::{
    ChangeTokenBackend, ChangeTokenCache, ChangeTokenEntry, SqliteChangeTokenCache,
};
pub use error::{StorageError, TransferError};
pub use io_manager::IOManager;
pub use object_service::{
    HttpObjectTransport, ObjectServiceBackend, ObjectTransport, PresignedTarget,
    OBJECT_SERVICE_STORAGE_TYPE,
};
pub use public_bucket::{PublicBucketBackend, PUBLIC_BUCKET_STORAGE_TYPE};
pub use traits::{ObjectInfo, StorageClient};
pub use transfer::{run_transfers, TransferItem};
pub use types::{
    AwsCredentials, BackendMetadata, OperationType, ParameterKind, ParameterSpec, PullObject,
    PullResult, PushObject, PushResult, S3Settings, TransferProgress,
};
