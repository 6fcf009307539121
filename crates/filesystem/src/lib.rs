//! File system operations for dataset sync.
//!
//! This crate provides everything that touches a revision's working tree
//! directly:
//! - `SmartHash` - Fingerprints (`key||size||mtime`) and parallel content hashing
//! - `walk_revision_dir()` - Sorted tree walk producing manifest keys
//! - `GlobFilter` - Built-in and `.datasetignore` exclusions

pub mod error;
pub mod glob;
pub mod smarthash;
pub mod walk;

// Re-export main types
pub use error::FileSystemError;
pub use glob::GlobFilter;
pub use smarthash::{hash_keys, HashBatchResult, SmartHash};
pub use walk::{walk_revision_dir, WalkEntry};
