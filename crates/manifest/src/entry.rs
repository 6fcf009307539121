//! Manifest rows, shard records and queued mutations.

use std::collections::BTreeMap;

use dataset_sync_common::is_directory_key;
use serde::{Deserialize, Serialize};

/// Shard that holds entries migrated out of the legacy `manifest0` file.
pub const LEGACY_SHARD_NAME: &str = "manifest-legacy.json";

/// Name of the read-only legacy manifest file.
pub const LEGACY_MANIFEST_NAME: &str = "manifest0";

/// Shard file owned by a revision.
///
/// # Arguments
/// * `revision` - Revision identifier the shard was started in
pub fn shard_file_name(revision: &str) -> String {
    format!("manifest-{}.json", revision)
}

/// Whether a file name in the manifest directory is a shard.
pub fn is_shard_file_name(name: &str) -> bool {
    name.starts_with("manifest-") && name.ends_with(".json")
}

/// One tracked path and its content metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Manifest key; directories end with `/`.
    pub relative_path: String,
    /// Hex BLAKE2b-512 of the contents (the directory sentinel for directories).
    pub content_hash: String,
    /// ISO-8601 modification time.
    pub modified_on: String,
    /// Size in bytes, string-encoded. Directories record `4096`.
    pub num_bytes: String,
    /// Shard file that owns this entry.
    pub shard_file: String,
}

impl ManifestEntry {
    /// Rebuild an entry from its on-disk shard record.
    pub fn from_record(relative_path: String, record: ShardRecord, shard_file: &str) -> Self {
        Self {
            relative_path,
            content_hash: record.h,
            modified_on: record.m,
            num_bytes: record.b,
            shard_file: shard_file.to_string(),
        }
    }

    /// The `{h, m, b}` record written to the shard.
    pub fn to_record(&self) -> ShardRecord {
        ShardRecord {
            h: self.content_hash.clone(),
            m: self.modified_on.clone(),
            b: self.num_bytes.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        is_directory_key(&self.relative_path)
    }

    /// Parsed size, or `None` if `num_bytes` is not an integer.
    pub fn size(&self) -> Option<u64> {
        self.num_bytes.parse().ok()
    }
}

/// On-disk value for one path in a shard file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub h: String,
    pub m: String,
    pub b: String,
}

/// Full contents of one shard file, keyed by manifest path.
pub type ShardContents = BTreeMap<String, ShardRecord>;

/// A queued change against one shard file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistTask {
    /// A path that was not tracked before.
    Add(ManifestEntry),
    /// New metadata for a tracked path, written to the shard that already owns it.
    Update(ManifestEntry),
    /// Removal of a tracked path from its shard.
    Delete {
        relative_path: String,
        shard_file: String,
    },
}

impl PersistTask {
    /// Shard the task writes to.
    pub fn shard_file(&self) -> &str {
        match self {
            PersistTask::Add(entry) | PersistTask::Update(entry) => &entry.shard_file,
            PersistTask::Delete { shard_file, .. } => shard_file,
        }
    }

    /// Apply the task to a shard's contents.
    pub fn apply(&self, contents: &mut ShardContents) {
        match self {
            PersistTask::Add(entry) | PersistTask::Update(entry) => {
                contents.insert(entry.relative_path.clone(), entry.to_record());
            }
            PersistTask::Delete { relative_path, .. } => {
                contents.remove(relative_path);
            }
        }
    }
}
