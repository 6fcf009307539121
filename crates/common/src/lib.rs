//! Shared types and utilities for dataset sync.
//!
//! This crate provides common functionality used across all dataset-sync crates:
//! - Content hashing (BLAKE2b-512, hex encoded)
//! - Path normalization between host paths and manifest keys
//! - Timestamp formatting for manifest `modified_on` fields
//! - Generic progress callback trait
//! - Shared constants, settings and error types

pub mod config;
pub mod constants;
pub mod error;
pub mod hash;
pub mod path_utils;
pub mod progress;
pub mod time;

// Re-export commonly used items at crate root
pub use config::SyncSettings;
pub use constants::*;
pub use error::{PathError, SettingsError};
pub use hash::{directory_hash, hash_bytes, hash_file, is_content_hash, Blake2bHasher};
pub use path_utils::{
    from_posix_path, is_directory_key, is_within_root, lexical_normalize, normalize_for_manifest,
    parent_directory_keys, to_absolute, to_posix_path,
};
pub use progress::{progress_fn, CountProgress, FnProgress, NoOpProgress, ProgressCallback};
pub use time::{
    current_epoch_seconds, float_to_iso_datetime_string, now_iso_string, system_time_to_iso_string,
};
