//! Sharded dataset manifest and content-addressed object store.
//!
//! This crate provides:
//! - `ManifestFileCache` - Path-to-entry store split across JSON shard files,
//!   with a write-ahead log and a pluggable fast cache
//! - `Manifest` - Status, update and commit of a revision's working tree
//! - `ObjectStore` / `RefCountTable` - Content objects, upload staging and
//!   reference counts
//! - `DatasetRepository` - The repository seam, and `StandaloneRepository`
//!   which implements it with plain files

pub mod activity;
pub mod cache;
pub mod context;
pub mod entry;
pub mod error;
pub mod file_cache;
pub mod legacy;
pub mod manifest;
pub mod objects;
pub mod refcount;
pub mod standalone;
pub mod status;
pub mod wal;

// Re-export main types
pub use activity::{ActivityAction, ActivityDetail, ActivityRecord, UpdateSummary};
pub use cache::{
    shard_signature, CacheClock, ManifestCache, ManifestCacheBackend, ManualClock,
    MemoryManifestCache, SqliteManifestCache,
};
pub use context::{DatasetRepository, RepositoryLock};
pub use entry::{
    shard_file_name, ManifestEntry, PersistTask, ShardContents, ShardRecord, LEGACY_MANIFEST_NAME,
    LEGACY_SHARD_NAME,
};
pub use error::ManifestError;
pub use file_cache::{read_shards, ManifestFileCache, ManifestMap};
pub use manifest::Manifest;
pub use objects::{ObjectStore, StagedPush};
pub use refcount::{ObjectRef, RefCountTable};
pub use standalone::{LoggedActivity, StandaloneRepository};
pub use status::StatusResult;
pub use wal::{WalRecord, WriteAheadLog};
